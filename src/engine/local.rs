use super::{
    is_ignored, CacheSharing, Container, Directory, Engine, ExecOptions, ExecOutput, ExecRecord,
    File, Mount, Platform,
};
use crate::error::{Error, Result};
use crate::installers::sanitize_component;
use crate::util::fs::{copy_entry, copy_tree, remove_path};
use crate::util::xdg;
use std::collections::{BTreeSet, HashMap};
use std::env;
use std::ffi::OsString;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Engine running commands as host processes over copy-on-write layer directories.
///
/// Each command gets a fresh layer holding a full copy of the container
/// filesystem, so earlier container values stay valid after later commands.
/// Layers live under a per-run directory that is removed when the engine is
/// dropped; cache volumes persist between runs.
///
/// Layers are plain copies, so disk use grows with every command run (binary
/// and `.terraform/` providers included) until the engine is dropped. Keep
/// one engine per workflow rather than per process.
#[derive(Debug)]
pub struct LocalEngine {
    layers: PathBuf,
    volumes: PathBuf,
    platform: Platform,
    counter: AtomicU64,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LocalEngine {
    /// Engine rooted in the XDG state (layers) and cache (volumes) directories.
    pub fn new() -> Result<Self> {
        Self::with_roots(
            &xdg::state_dir()?.join("layers"),
            &xdg::cache_dir()?.join("volumes"),
        )
    }

    /// Engine keeping both layers and volumes below `root`.
    pub fn with_root(root: &Path) -> Result<Self> {
        Self::with_roots(&root.join("layers"), &root.join("volumes"))
    }

    fn with_roots(layers_root: &Path, volumes: &Path) -> Result<Self> {
        let run = format!(
            "{}-{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S%3f"),
            std::process::id()
        );
        let layers = layers_root.join(run);
        fs::create_dir_all(&layers).map_err(|err| Error::io(&layers, err))?;
        fs::create_dir_all(volumes).map_err(|err| Error::io(volumes, err))?;

        debug!(layers = ?layers, volumes = ?volumes, "local engine ready");

        Ok(Self {
            layers,
            volumes: volumes.to_path_buf(),
            platform: Platform::host(),
            counter: AtomicU64::new(0),
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Directory holding this run's layers.
    pub fn layers_dir(&self) -> &Path {
        &self.layers
    }

    /// Host directory backing a shared cache volume.
    pub fn volume_dir(&self, key: &str) -> PathBuf {
        self.volumes.join(sanitize_component(key))
    }

    fn next_layer(&self) -> Result<PathBuf> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst);
        let layer = self.layers.join(format!("{index:06}"));
        fs::create_dir_all(&layer).map_err(|err| Error::io(&layer, err))?;
        Ok(layer)
    }

    fn volume_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key.to_string()).or_default().clone()
    }
}

impl Drop for LocalEngine {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.layers) {
            debug!(layers = ?self.layers, error = %err, "failed to remove layers");
        }
    }
}

fn host_path(root: &Path, container_path: &str) -> PathBuf {
    root.join(container_path.trim_start_matches('/'))
}

fn no_skip(_: &str, _: bool) -> bool {
    false
}

/// Map a container path to its host location, honoring directory and file mounts.
fn locate(container: &Container, path: &str) -> PathBuf {
    for (target, mount) in container.mounts().iter().rev() {
        match mount {
            Mount::File(file) if target == path => return file.path().to_path_buf(),
            Mount::Directory(directory) => {
                if target == path {
                    return directory.path().to_path_buf();
                }
                if let Some(rest) = path
                    .strip_prefix(target.as_str())
                    .and_then(|rest| rest.strip_prefix('/'))
                {
                    return directory.path().join(rest);
                }
            }
            _ => {}
        }
    }
    host_path(container.rootfs().path(), path)
}

/// Rewrite values pointing into a cache mount so the host process sees the volume.
fn translate(value: &str, caches: &[(String, PathBuf)]) -> OsString {
    for (target, dir) in caches {
        if value == target {
            return dir.clone().into_os_string();
        }
        if let Some(rest) = value
            .strip_prefix(target.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
        {
            return dir.join(rest).into_os_string();
        }
    }
    OsString::from(value)
}

fn redact(text: String, secrets: &[&str]) -> String {
    secrets
        .iter()
        .filter(|secret| !secret.is_empty())
        .fold(text, |text, secret| text.replace(secret, "***"))
}

fn resolve_program(layer: &Path, program: &str) -> PathBuf {
    if program.starts_with('/') {
        let candidate = host_path(layer, program);
        if candidate.is_file() {
            return candidate;
        }
    }
    PathBuf::from(program)
}

fn search_path(layer: &Path) -> Option<OsString> {
    let mut paths = vec![layer.join("usr/local/bin"), layer.join("usr/bin")];
    if let Some(existing) = env::var_os("PATH") {
        paths.extend(env::split_paths(&existing));
    }
    env::join_paths(paths).ok()
}

fn spawn_reader<R>(
    source: Option<R>,
    combined: Arc<Mutex<Vec<u8>>>,
) -> JoinHandle<io::Result<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut captured = Vec::new();
        let Some(mut source) = source else {
            return Ok(captured);
        };

        let mut buffer = [0u8; 8192];
        loop {
            let read = match source.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            captured.extend_from_slice(&buffer[..read]);
            combined
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(&buffer[..read]);
        }
        Ok(captured)
    })
}

fn join_reader(handle: JoinHandle<io::Result<Vec<u8>>>, program: &Path) -> Result<Vec<u8>> {
    handle
        .join()
        .map_err(|_| io::Error::other("output reader panicked"))
        .and_then(|result| result)
        .map_err(|err| Error::io(program, err))
}

impl Engine for LocalEngine {
    fn platform(&self) -> Result<Platform> {
        Ok(self.platform.clone())
    }

    fn container(&self, platform: Option<&Platform>) -> Result<Container> {
        if let Some(platform) = platform {
            if *platform != self.platform {
                return Err(Error::configuration(format!(
                    "local engine cannot run {platform} containers on a {} host",
                    self.platform
                )));
            }
        }

        let rootfs = self.scratch()?;
        Ok(Container::new(self.platform.clone(), rootfs, "/"))
    }

    fn scratch(&self) -> Result<Directory> {
        Ok(Directory::new(self.next_layer()?))
    }

    fn host_directory(&self, path: &Path, ignore: &[&str]) -> Result<Directory> {
        if !path.is_dir() {
            return Err(Error::NotFound {
                path: path.display().to_string(),
            });
        }

        let layer = self.next_layer()?;
        copy_tree(path, &layer, &|relative, is_dir| {
            is_ignored(relative, is_dir, ignore)
        })?;
        Ok(Directory::new(layer))
    }

    fn host_file(&self, path: &Path) -> Result<File> {
        if !path.is_file() {
            return Err(Error::NotFound {
                path: path.display().to_string(),
            });
        }

        let name = path.file_name().unwrap_or(path.as_os_str());
        let target = self.next_layer()?.join(name);
        copy_entry(path, &target)?;
        Ok(File::new(target))
    }

    fn with_file(&self, directory: &Directory, path: &str, file: &File) -> Result<Directory> {
        let layer = self.next_layer()?;
        copy_tree(directory.path(), &layer, &no_skip)?;
        copy_entry(file.path(), &host_path(&layer, path))?;
        Ok(Directory::new(layer))
    }

    fn exec(
        &self,
        container: &Container,
        args: &[String],
        options: ExecOptions,
    ) -> Result<ExecOutput> {
        let mut command = Vec::new();
        if options.use_entrypoint {
            command.extend(container.entrypoint().iter().cloned());
        }
        command.extend(args.iter().cloned());
        let Some((program, program_args)) = command.split_first() else {
            return Err(Error::configuration("no command to execute"));
        };

        let layer = self.next_layer()?;
        let scratch_caches = layer.with_extension("caches");

        copy_tree(container.rootfs().path(), &layer, &no_skip)?;
        for (path, directory) in container.overlays() {
            copy_tree(directory.path(), &host_path(&layer, path), &no_skip)?;
        }

        let mut caches = Vec::new();
        let mut locked_keys = BTreeSet::new();
        for (path, mount) in container.mounts() {
            let target = host_path(&layer, path);
            match mount {
                Mount::Directory(directory) => {
                    if path != "/" {
                        remove_path(&target)?;
                    }
                    copy_tree(directory.path(), &target, &no_skip)?;
                }
                Mount::File(file) => copy_entry(file.path(), &target)?,
                Mount::Cache { volume, sharing } => {
                    let dir = match sharing {
                        CacheSharing::Private => {
                            scratch_caches.join(sanitize_component(volume.key()))
                        }
                        CacheSharing::Shared | CacheSharing::Locked => {
                            self.volume_dir(volume.key())
                        }
                    };
                    fs::create_dir_all(&dir).map_err(|err| Error::io(&dir, err))?;
                    if *sharing == CacheSharing::Locked {
                        locked_keys.insert(volume.key().to_string());
                    }
                    caches.push((path.clone(), dir));
                }
            }
        }

        let workdir = host_path(&layer, container.workdir());
        fs::create_dir_all(&workdir).map_err(|err| Error::io(&workdir, err))?;

        let program_path = resolve_program(&layer, program);
        let mut process = Command::new(&program_path);
        process
            .args(program_args)
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(path) = search_path(&layer) {
            process.env("PATH", path);
        }
        for (name, value) in container.env_variables() {
            process.env(name, translate(value, &caches));
        }
        let secrets: Vec<&str> = container
            .secret_variables()
            .map(|secret| {
                process.env(secret.name(), secret.plaintext());
                secret.plaintext()
            })
            .collect();

        // One guard per volume, taken in key order.
        let locks: Vec<Arc<Mutex<()>>> = locked_keys
            .iter()
            .map(|key| self.volume_lock(key))
            .collect();
        let _guards: Vec<MutexGuard<'_, ()>> = locks
            .iter()
            .map(|lock| lock.lock().unwrap_or_else(PoisonError::into_inner))
            .collect();

        debug!(command = ?command, workdir = %container.workdir(), "exec");
        let mut child = process
            .spawn()
            .map_err(|err| Error::io(&program_path, err))?;

        let combined = Arc::new(Mutex::new(Vec::new()));
        let stdout_reader = spawn_reader(child.stdout.take(), Arc::clone(&combined));
        let stderr_reader = spawn_reader(child.stderr.take(), Arc::clone(&combined));

        let status = child
            .wait()
            .map_err(|err| Error::io(&program_path, err))?;
        let stdout = join_reader(stdout_reader, &program_path)?;
        let stderr = join_reader(stderr_reader, &program_path)?;
        let combined =
            std::mem::take(&mut *combined.lock().unwrap_or_else(PoisonError::into_inner));

        if let Err(err) = remove_path(&scratch_caches) {
            warn!(error = %err, "failed to remove private cache volumes");
        }

        let record = ExecRecord {
            command,
            stdout: redact(String::from_utf8_lossy(&stdout).into_owned(), &secrets),
            stderr: redact(String::from_utf8_lossy(&stderr).into_owned(), &secrets),
            combined: redact(String::from_utf8_lossy(&combined).into_owned(), &secrets),
            exit_code: status.code().unwrap_or(-1),
        };
        debug!(exit_code = record.exit_code, "exec finished");

        Ok(ExecOutput {
            container: container.with_exec_result(Directory::new(layer), record.clone()),
            record,
        })
    }

    fn read_file(&self, directory: &Directory, path: &str) -> Result<Option<Vec<u8>>> {
        let target = host_path(directory.path(), path);
        match fs::read(&target) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::io(target, err)),
        }
    }

    fn container_file(&self, container: &Container, path: &str) -> Result<File> {
        let resolved = container.resolve(path);
        let location = locate(container, &resolved);
        if !location.is_file() {
            return Err(Error::NotFound { path: resolved });
        }
        Ok(File::new(location))
    }

    fn container_directory(&self, container: &Container, path: &str) -> Result<Directory> {
        let resolved = container.resolve(path);
        let location = locate(container, &resolved);
        if !location.is_dir() {
            return Err(Error::NotFound { path: resolved });
        }
        Ok(Directory::new(location))
    }

    fn sync(&self, container: &Container) -> Result<Container> {
        if !container.rootfs().path().is_dir() {
            return Err(Error::NotFound {
                path: container.rootfs().path().display().to_string(),
            });
        }
        Ok(container.clone())
    }
}
