// Directory-backed removable media for host dry runs

use std::fs::File;
use std::io;
use std::path::{Component, Path, PathBuf};

use log::debug;

use crate::platform::RemovableMedia;

/// Treats a host directory as the root of the SD card
pub struct DirectoryMedia {
    root: PathBuf,
    mounted: bool,
}

impl DirectoryMedia {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mounted: false,
        }
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("'{}' is not a plain relative path", path),
            ));
        }
        Ok(self.root.join(relative))
    }
}

impl RemovableMedia for DirectoryMedia {
    type File = File;

    fn mount(&mut self) -> io::Result<()> {
        if !self.root.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a directory", self.root.display()),
            ));
        }
        debug!("Mounted {}", self.root.display());
        self.mounted = true;
        Ok(())
    }

    fn open(&mut self, path: &str) -> io::Result<Option<(File, u64)>> {
        if !self.mounted {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "media not mounted"));
        }
        let full = self.resolve(path)?;
        match File::open(&full) {
            Ok(file) => {
                let len = file.metadata()?.len();
                Ok(Some((file, len)))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn unmount(&mut self) -> io::Result<()> {
        self.mounted = false;
        Ok(())
    }
}
