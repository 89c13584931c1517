//! Program images stored as a directory.
//!
//! ```text
//! image.toml      layout and mutation flag
//! text            compiled code
//! state           stack, globals and memory
//! snapshot.wasm   snapshot sections of the last suspended run (optional)
//! ```

use std::fs::{self, File};
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::runtime::image_info::{StackVars, STACK_VARS_SIZE};
use crate::runtime::{ProgramCode, ProgramState};
use crate::snapshot::{self, Buffers, Snapshot};

pub const MANIFEST_FILE: &str = "image.toml";
pub const TEXT_FILE: &str = "text";
pub const STATE_FILE: &str = "state";
pub const SNAPSHOT_FILE: &str = "snapshot.wasm";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageManifest {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    pub text_size: u32,
    #[serde(default)]
    pub random_seed: bool,
    /// Fixed once the program has run.
    #[serde(default)]
    pub text_addr: u64,
    pub stack_size: u32,
    #[serde(default)]
    pub stack_usage: u32,
    #[serde(default)]
    pub globals_size: u32,
    #[serde(default)]
    pub mem_size: u32,
    pub max_mem_size: u32,
    #[serde(default)]
    pub start_addr: u32,
    pub entry_addr: u32,
    #[serde(default)]
    pub monotonic_time: u64,
    /// Set while a run may be modifying the state file.
    #[serde(default)]
    pub dirty: bool,
}

fn default_page_size() -> u32 {
    4096
}

pub struct ImageDir {
    dir: PathBuf,
    text: File,
    manifest: Mutex<ImageManifest>,
}

impl ImageDir {
    pub fn open(dir: &Path) -> Result<Self> {
        let manifest = read_manifest(dir)?;
        let text = File::open(dir.join(TEXT_FILE))?;
        let text_len = text.metadata()?.len();
        if text_len < u64::from(manifest.text_size) {
            return Err(Error::BadProgram(format!(
                "text file is {text_len} bytes, manifest says {}",
                manifest.text_size
            )));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            text,
            manifest: Mutex::new(manifest),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn manifest(&self) -> ImageManifest {
        self.lock().clone()
    }

    /// Whether the state on disk may be half-written by an unfinished run.
    pub fn check_mutation(&self) -> Result<bool> {
        Ok(read_manifest(&self.dir)?.dirty)
    }

    /// Clears the mutation flag, applying `update` to the manifest first.
    pub fn end_mutation(&self, update: impl FnOnce(&mut ImageManifest)) -> Result<()> {
        let mut manifest = self.lock();
        update(&mut manifest);
        manifest.dirty = false;
        write_manifest(&self.dir, &manifest)?;
        Ok(())
    }

    /// Clears the mutation flag after a suspension. The stack usage and
    /// memory size the loader recorded in the state's stack-vars header are
    /// carried into the manifest, so that the next start resumes the
    /// program.
    pub fn end_suspended_mutation(&self, monotonic_time: u64) -> Result<()> {
        let vars = self.read_stack_vars()?;
        let mut manifest = self.lock();

        if vars.stack_unused == 0 || vars.stack_unused >= manifest.stack_size {
            return Err(Error::BadProgram(format!(
                "suspended program reports {} unused bytes of a {} byte stack",
                vars.stack_unused, manifest.stack_size
            )));
        }
        let mem_size = match vars.mem_size() {
            Some(size) if size <= manifest.max_mem_size => size,
            _ => {
                return Err(Error::BadProgram(format!(
                    "suspended program reports {} memory pages, limit is {} bytes",
                    vars.memory_pages, manifest.max_mem_size
                )))
            }
        };

        manifest.stack_usage = manifest.stack_size - vars.stack_unused;
        manifest.mem_size = mem_size;
        manifest.monotonic_time = monotonic_time;
        manifest.dirty = false;
        write_manifest(&self.dir, &manifest)?;
        debug!(
            "Image {} suspended with {} bytes of stack in use",
            self.dir.display(),
            manifest.stack_usage
        );
        Ok(())
    }

    fn read_stack_vars(&self) -> Result<StackVars> {
        let state = File::open(self.dir.join(STATE_FILE))?;
        let mut buf = [0u8; STACK_VARS_SIZE];
        state.read_exact_at(&mut buf, 0)?;
        Ok(StackVars::decode(&buf))
    }

    /// Snapshot sections left by the last suspended run.
    pub fn read_snapshot(&self) -> Result<Option<(Snapshot, Buffers)>> {
        let module = match fs::read(self.dir.join(SNAPSHOT_FILE)) {
            Ok(module) => module,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match snapshot::read_sections(&module)? {
            (Some(snapshot), buffers) => Ok(Some((snapshot, buffers.unwrap_or_default()))),
            (None, _) => Err(Error::BadProgram(format!(
                "{SNAPSHOT_FILE} has no snapshot section"
            ))),
        }
    }

    pub fn write_snapshot(&self, snapshot: &Snapshot, buffers: &Buffers) -> Result<()> {
        let module = snapshot::encode_module(snapshot, buffers);
        write_atomic(&self.dir.join(SNAPSHOT_FILE), &module)?;
        Ok(())
    }

    pub fn remove_snapshot(&self) -> Result<()> {
        match fs::remove_file(self.dir.join(SNAPSHOT_FILE)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ImageManifest> {
        self.manifest.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ProgramCode for ImageDir {
    fn page_size(&self) -> u32 {
        self.lock().page_size
    }

    fn text_size(&self) -> u32 {
        self.lock().text_size
    }

    fn text_fd(&self) -> BorrowedFd<'_> {
        self.text.as_fd()
    }

    fn random_seed(&self) -> bool {
        self.lock().random_seed
    }
}

impl ProgramState for ImageDir {
    fn text_addr(&self) -> u64 {
        self.lock().text_addr
    }

    fn stack_size(&self) -> u32 {
        self.lock().stack_size
    }

    fn stack_usage(&self) -> u32 {
        self.lock().stack_usage
    }

    fn globals_size(&self) -> u32 {
        self.lock().globals_size
    }

    fn mem_size(&self) -> u32 {
        self.lock().mem_size
    }

    fn max_mem_size(&self) -> u32 {
        self.lock().max_mem_size
    }

    fn start_addr(&self) -> u32 {
        self.lock().start_addr
    }

    fn entry_addr(&self) -> u32 {
        self.lock().entry_addr
    }

    fn monotonic_time(&self) -> u64 {
        self.lock().monotonic_time
    }

    fn begin_mutation(&self, text_addr: u64) -> io::Result<OwnedFd> {
        let mut manifest = self.lock();
        manifest.text_addr = text_addr;
        manifest.dirty = true;
        write_manifest(&self.dir, &manifest)?;

        let state = File::options()
            .read(true)
            .write(true)
            .open(self.dir.join(STATE_FILE))?;
        debug!("Image {} marked dirty", self.dir.display());
        Ok(OwnedFd::from(state))
    }
}

fn read_manifest(dir: &Path) -> Result<ImageManifest> {
    let path = dir.join(MANIFEST_FILE);
    let content = fs::read_to_string(&path)?;
    toml::from_str(&content)
        .map_err(|e| Error::BadProgram(format!("{}: {e}", path.display())))
}

fn write_manifest(dir: &Path, manifest: &ImageManifest) -> io::Result<()> {
    let content = toml::to_string(manifest).map_err(io::Error::other)?;
    write_atomic(&dir.join(MANIFEST_FILE), content.as_bytes())
}

/// Writes through a temporary file and renames it over `path`.
fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)
}
