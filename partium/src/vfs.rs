//! The virtual filesystem seam.
//!
//! Include resolution only ever talks to these traits, so headers can come
//! from the real disk, from memory, or from anything an embedder dreams up.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// A handle to one potential header resource.
pub trait VirtualFile {
    /// The full path of this handle, used for display, `#pragma once`
    /// bookkeeping and quoted-include sibling lookup.
    fn path(&self) -> &str;

    /// True if the resource exists and is readable as a file.
    fn is_file(&self) -> bool;

    /// The containing directory, if there is one.
    fn parent_file(&self) -> Option<Rc<dyn VirtualFile>>;

    /// A child of this handle treated as a directory.
    fn child_file(&self, name: &str) -> Rc<dyn VirtualFile>;

    /// The file contents.
    ///
    /// # Errors
    /// Returns an I/O error if the resource cannot be read.
    fn read(&self) -> io::Result<String>;
}

/// Resolves paths to [`VirtualFile`] handles.
pub trait VirtualFileSystem {
    /// A handle for an absolute or already-joined path.
    fn get_file(&self, path: &str) -> Rc<dyn VirtualFile>;

    /// A handle for `name` inside `dir`.
    fn get_file_in(&self, dir: &str, name: &str) -> Rc<dyn VirtualFile>;
}

/// The real disk.
pub struct DiskFileSystem;

struct DiskFile {
    path: PathBuf,
    display: String,
}

impl DiskFile {
    fn new(path: PathBuf) -> Rc<dyn VirtualFile> {
        let display = path.to_string_lossy().into_owned();
        Rc::new(DiskFile { path, display })
    }
}

impl VirtualFile for DiskFile {
    fn path(&self) -> &str {
        &self.display
    }

    fn is_file(&self) -> bool {
        self.path.is_file()
    }

    fn parent_file(&self) -> Option<Rc<dyn VirtualFile>> {
        self.path.parent().map(|p| DiskFile::new(p.to_path_buf()))
    }

    fn child_file(&self, name: &str) -> Rc<dyn VirtualFile> {
        DiskFile::new(self.path.join(name))
    }

    fn read(&self) -> io::Result<String> {
        std::fs::read_to_string(&self.path)
    }
}

impl VirtualFileSystem for DiskFileSystem {
    fn get_file(&self, path: &str) -> Rc<dyn VirtualFile> {
        DiskFile::new(PathBuf::from(path))
    }

    fn get_file_in(&self, dir: &str, name: &str) -> Rc<dyn VirtualFile> {
        DiskFile::new(Path::new(dir).join(name))
    }
}

/// An in-memory filesystem for tests and embedding.
///
/// Paths are plain `/`-separated strings; whatever was registered with
/// [`add_file`](MemoryFileSystem::add_file) exists, everything else does not.
#[derive(Default)]
pub struct MemoryFileSystem {
    files: Rc<RefCell<HashMap<String, String>>>,
}

impl MemoryFileSystem {
    /// An empty filesystem.
    #[must_use]
    pub fn new() -> Self {
        MemoryFileSystem::default()
    }

    /// Register a file. Leading `/` is not required; lookups are literal.
    pub fn add_file(&self, path: impl Into<String>, contents: impl Into<String>) {
        self.files
            .borrow_mut()
            .insert(normalize(&path.into()), contents.into());
    }
}

fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    let joined = parts.join("/");
    if path.starts_with('/') {
        format!("/{joined}")
    } else {
        joined
    }
}

struct MemoryFile {
    files: Rc<RefCell<HashMap<String, String>>>,
    path: String,
}

impl VirtualFile for MemoryFile {
    fn path(&self) -> &str {
        &self.path
    }

    fn is_file(&self) -> bool {
        self.files.borrow().contains_key(&self.path)
    }

    fn parent_file(&self) -> Option<Rc<dyn VirtualFile>> {
        let (dir, _) = self.path.rsplit_once('/')?;
        Some(Rc::new(MemoryFile {
            files: self.files.clone(),
            path: dir.to_string(),
        }))
    }

    fn child_file(&self, name: &str) -> Rc<dyn VirtualFile> {
        Rc::new(MemoryFile {
            files: self.files.clone(),
            path: normalize(&format!("{}/{}", self.path, name)),
        })
    }

    fn read(&self) -> io::Result<String> {
        self.files.borrow().get(&self.path).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no such file: {}", self.path))
        })
    }
}

impl VirtualFileSystem for MemoryFileSystem {
    fn get_file(&self, path: &str) -> Rc<dyn VirtualFile> {
        Rc::new(MemoryFile {
            files: self.files.clone(),
            path: normalize(path),
        })
    }

    fn get_file_in(&self, dir: &str, name: &str) -> Rc<dyn VirtualFile> {
        self.get_file(&format!("{dir}/{name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_lookup() {
        let fs = MemoryFileSystem::new();
        fs.add_file("inc/foo.h", "#define FOO 1\n");
        assert!(fs.get_file("inc/foo.h").is_file());
        assert!(!fs.get_file("inc/bar.h").is_file());
        assert_eq!(
            fs.get_file_in("inc", "foo.h").read().ok().as_deref(),
            Some("#define FOO 1\n")
        );
    }

    #[test]
    fn memory_parent_and_child() {
        let fs = MemoryFileSystem::new();
        fs.add_file("a/b/c.h", "x");
        let file = fs.get_file("a/b/c.h");
        let dir = file.parent_file().unwrap();
        assert_eq!(dir.path(), "a/b");
        assert!(dir.child_file("c.h").is_file());
    }

    #[test]
    fn normalize_collapses_dots() {
        assert_eq!(normalize("a/./b/../c.h"), "a/c.h");
        assert_eq!(normalize("/usr//include/x.h"), "/usr/include/x.h");
    }
}
