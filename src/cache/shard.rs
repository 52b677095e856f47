//! Quad-tree sharded spillover directories.
//!
//! One image's spill area is a directory tree built by recursively halving
//! the `nb_x × nb_y` tile index space. Each node covers a span of tile
//! indices; a node whose span exceeds two tiles in both axes has four
//! children (`D00`, `D10`, `D01`, `D11`), a node that exceeds two tiles in
//! only one axis has two (`D00`/`D10` or `D00`/`D01`), and a node covering
//! at most 2×2 tiles is a leaf. No directory ever holds more than four
//! entries, so the tree scales to millions of tiles.
//!
//! ```text
//! root/
//!   D00/ D10/ D01/ D11/
//!     D00/ ...
//!       0_0.tile 1_0.tile 0_1.tile 1_1.tile
//! ```
//!
//! [`DirectoryShard::create`] and [`DirectoryShard::path`] walk the same
//! [`Span`] subdivision, so every path resolves inside the created tree.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ShardError {
    #[error("Tile ({x}, {y}) is outside the {nb_x}x{nb_y} shard grid")]
    Exhausted { x: u32, y: u32, nb_x: u32, nb_y: u32 },

    #[error("Shard grid must be non-empty, got {nb_x}x{nb_y}")]
    EmptyGrid { nb_x: u32, nb_y: u32 },

    #[error("Shard directory I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A rectangle of tile indices covered by one directory node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

impl Span {
    fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }

    /// Child directories of this node, in creation order.
    fn children(&self) -> Vec<(&'static str, Span)> {
        let Span {
            x,
            y,
            width,
            height,
        } = *self;
        let half_w = width.div_ceil(2);
        let half_h = height.div_ceil(2);

        match (width > 2, height > 2) {
            (true, true) => vec![
                ("D00", Span { x, y, width: half_w, height: half_h }),
                ("D10", Span { x: x + half_w, y, width: width - half_w, height: half_h }),
                ("D01", Span { x, y: y + half_h, width: half_w, height: height - half_h }),
                ("D11", Span { x: x + half_w, y: y + half_h, width: width - half_w, height: height - half_h }),
            ],
            (true, false) => vec![
                ("D00", Span { x, y, width: half_w, height }),
                ("D10", Span { x: x + half_w, y, width: width - half_w, height }),
            ],
            (false, true) => vec![
                ("D00", Span { x, y, width, height: half_h }),
                ("D01", Span { x, y: y + half_h, width, height: height - half_h }),
            ],
            (false, false) => Vec::new(),
        }
    }
}

/// Maps tile coordinates of one image to files in a bounded fan-out tree.
#[derive(Debug)]
pub struct DirectoryShard {
    root: PathBuf,
    nb_x: u32,
    nb_y: u32,
    /// Leaf file extension, including the leading dot.
    extension: String,
    delete_on_exit: bool,
}

impl DirectoryShard {
    pub fn new(
        root: impl Into<PathBuf>,
        nb_x: u32,
        nb_y: u32,
        extension: &str,
        delete_on_exit: bool,
    ) -> Result<Self, ShardError> {
        if nb_x == 0 || nb_y == 0 {
            return Err(ShardError::EmptyGrid { nb_x, nb_y });
        }
        let extension = match extension.trim_start_matches('.') {
            "" => String::new(),
            ext => format!(".{ext}"),
        };
        Ok(Self {
            root: root.into(),
            nb_x,
            nb_y,
            extension,
            delete_on_exit,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn grid(&self) -> (u32, u32) {
        (self.nb_x, self.nb_y)
    }

    fn full_span(&self) -> Span {
        Span {
            x: 0,
            y: 0,
            width: self.nb_x,
            height: self.nb_y,
        }
    }

    /// Eagerly build the whole directory tree. Returns the number of
    /// directories in the tree, the root included.
    pub fn create(&self) -> Result<usize, ShardError> {
        let created = create_node(&self.root, self.full_span())?;
        debug!(
            root = %self.root.display(),
            nb_x = self.nb_x,
            nb_y = self.nb_y,
            directories = created,
            "Created shard tree"
        );
        Ok(created)
    }

    /// Spill file path for tile `(x, y)`.
    pub fn path(&self, x: u32, y: u32) -> Result<PathBuf, ShardError> {
        if x >= self.nb_x || y >= self.nb_y {
            return Err(ShardError::Exhausted {
                x,
                y,
                nb_x: self.nb_x,
                nb_y: self.nb_y,
            });
        }

        let mut dir = self.root.clone();
        let mut span = self.full_span();
        while let Some((name, child)) = span
            .children()
            .into_iter()
            .find(|(_, child)| child.contains(x, y))
        {
            dir.push(name);
            span = child;
        }

        dir.push(format!("{x}_{y}{}", self.extension));
        Ok(dir)
    }

    /// Recursively delete the whole tree.
    pub fn dispose(&self) -> Result<(), ShardError> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {
                debug!(root = %self.root.display(), "Removed shard tree");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ShardError::Io {
                path: self.root.clone(),
                source,
            }),
        }
    }
}

fn create_node(dir: &Path, span: Span) -> Result<usize, ShardError> {
    fs::create_dir_all(dir).map_err(|source| ShardError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut created = 1;
    for (name, child) in span.children() {
        created += create_node(&dir.join(name), child)?;
    }
    Ok(created)
}

impl Drop for DirectoryShard {
    fn drop(&mut self) {
        if !self.delete_on_exit || !self.root.exists() {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.root) {
            warn!(root = %self.root.display(), error = %e, "Failed to remove shard tree on drop");
        }
    }
}
