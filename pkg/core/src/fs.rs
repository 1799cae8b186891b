use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

/// Holds an exclusive advisory lock on a directory for as long as it is alive.
///
/// Used to guarantee that at most one process ever treats a node's data directory
/// as its own: opening the same `dir` twice from two processes will fail the second
/// time rather than silently corrupting the durable store underneath it.
pub struct DirLock {
	dir: PathBuf,
	file: File,
}

impl DirLock {
	/// Opens (creating if necessary) the given directory and takes an exclusive lock
	/// on a sentinel file inside of it.
	pub fn open(dir: &Path) -> io::Result<DirLock> {
		std::fs::create_dir_all(dir)?;

		let lock_path = dir.join(".lock");
		let file = OpenOptions::new()
			.create(true)
			.read(true)
			.write(true)
			.open(&lock_path)?;

		file.try_lock_exclusive().map_err(|_| {
			io::Error::new(
				io::ErrorKind::WouldBlock,
				format!("directory {} is already locked by another process", dir.display()),
			)
		})?;

		Ok(DirLock { dir: dir.to_owned(), file })
	}

	pub fn path(&self) -> &Path {
		&self.dir
	}
}

impl Drop for DirLock {
	fn drop(&mut self) {
		let _ = FileExt::unlock(&self.file);
	}
}
