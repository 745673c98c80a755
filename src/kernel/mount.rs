/// Filesystem isolation through a private mount namespace
///
/// The parent resolves a `FilesystemView`: an empty tmpfs root holding
/// read-only binds of the directories the interpreter needs to start, plus
/// the scratch directory when one is granted. The child, already inside its
/// own mount namespace, builds that root and chroots into it. Host paths
/// outside the view, such as `/etc/passwd` or `/home`, do not exist for the
/// program.
///
/// Paths are converted to C strings before fork; `enter` only issues
/// syscalls.
use crate::config::types::{Result, SandboxError};
use crate::kernel::namespace;
use std::ffi::{CStr, CString};
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};

/// Host directories bound read-only so the interpreter and its shared
/// libraries resolve. Missing entries are skipped and top-level symlinks
/// (merged `/usr` layouts) are recreated as symlinks.
const SYSTEM_ROOTS: &[&str] = &["/usr", "/bin", "/sbin", "/lib", "/lib32", "/lib64", "/libx32"];

/// Single files the dynamic loader reads.
const SYSTEM_FILES: &[&str] = &["/etc/ld.so.cache"];

/// Empty directory every run mounts its private root on. The mounts live
/// in each child's own namespace, so concurrent runs share it.
pub fn default_stage() -> PathBuf {
    std::env::temp_dir().join("twibox-root")
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    /// Directory inside the new root; an existing one is fine.
    Dir(CString),
    /// Empty file for a host file to be bound onto.
    File(CString),
    Symlink { target: CString, link: CString },
    /// Bind `source` onto `target`, then remount it with `flags`.
    Bind {
        source: CString,
        target: CString,
        flags: libc::c_ulong,
    },
}

/// Private root for one run, resolved in the parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemView {
    root: CString,
    tmpfs: CString,
    tmpfs_options: CString,
    stage: CString,
    steps: Vec<Step>,
    workdir: CString,
}

impl FilesystemView {
    /// Plan the view for `interpreter`, exposing `scratch` read-only at its
    /// own path when given.
    pub fn plan(stage: &Path, interpreter: &Path, scratch: Option<&Path>) -> Result<Self> {
        ensure_stage(stage)?;
        let mut planner = Planner {
            stage,
            steps: Vec::new(),
            dirs: Vec::new(),
        };

        for root in SYSTEM_ROOTS.iter().map(Path::new) {
            let Ok(meta) = fs::symlink_metadata(root) else {
                continue;
            };
            if meta.file_type().is_symlink() {
                let target = fs::read_link(root)?;
                planner.symlink(&target, root)?;
            } else if meta.is_dir() {
                planner.bind(root, true)?;
            }
        }

        let interpreter = fs::canonicalize(interpreter)?;
        if !SYSTEM_ROOTS.iter().any(|root| interpreter.starts_with(root)) {
            // bin/python3 under an install prefix such as /opt/python
            match interpreter.parent().and_then(Path::parent) {
                Some(prefix) if prefix != Path::new("/") => planner.bind(prefix, true)?,
                _ => {
                    return Err(SandboxError::Config(format!(
                        "cannot expose interpreter {} inside the sandbox root",
                        interpreter.display()
                    )))
                }
            }
        }

        for file in SYSTEM_FILES.iter().map(Path::new) {
            if file.is_file() {
                planner.bind(file, false)?;
            }
        }

        let workdir = match scratch {
            Some(dir) => {
                planner.bind(dir, true)?;
                dir
            }
            None => Path::new("/"),
        };

        Ok(Self {
            root: cstring(Path::new("/"))?,
            tmpfs: CString::new("tmpfs").map_err(invalid_path)?,
            tmpfs_options: CString::new("mode=0755,size=1m").map_err(invalid_path)?,
            stage: cstring(stage)?,
            steps: planner.steps,
            workdir: cstring(workdir)?,
        })
    }

    /// Build the root and move into it. Must run in a fresh mount
    /// namespace with mount privileges. Async-signal-safe.
    pub fn enter(&self) -> io::Result<()> {
        // Nothing mounted from here on propagates back to the host.
        sys_mount(None, &self.root, None, libc::MS_REC | libc::MS_PRIVATE, None)?;
        sys_mount(
            Some(self.tmpfs.as_c_str()),
            &self.stage,
            Some(self.tmpfs.as_c_str()),
            libc::MS_NOSUID | libc::MS_NODEV,
            Some(self.tmpfs_options.as_c_str()),
        )?;

        for step in &self.steps {
            match step {
                Step::Dir(path) => make_dir(path)?,
                Step::File(path) => make_file(path)?,
                Step::Symlink { target, link } => {
                    // SAFETY: both arguments are NUL-terminated strings owned by the plan.
                    if unsafe { libc::symlink(target.as_ptr(), link.as_ptr()) } != 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Step::Bind { source, target, flags } => {
                    sys_mount(Some(source.as_c_str()), target, None, libc::MS_BIND | libc::MS_REC, None)?;
                    sys_mount(None, target, None, libc::MS_BIND | libc::MS_REMOUNT | flags, None)?;
                }
            }
        }

        sys_mount(
            None,
            &self.stage,
            None,
            libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY | libc::MS_NOSUID | libc::MS_NODEV,
            None,
        )?;

        // SAFETY: chroot and chdir read NUL-terminated paths owned by the plan.
        if unsafe { libc::chroot(self.stage.as_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::chdir(self.workdir.as_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Host paths visible inside the view, in mount order.
    pub fn exposed(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter_map(|step| match step {
                Step::Bind { source, .. } => Some(source.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect()
    }
}

struct Planner<'a> {
    stage: &'a Path,
    steps: Vec<Step>,
    dirs: Vec<PathBuf>,
}

impl Planner<'_> {
    fn staged(&self, host: &Path) -> PathBuf {
        let relative: PathBuf = host
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        self.stage.join(relative)
    }

    /// Directories from the stage down to `staged`, each planned once.
    fn dirs_to(&mut self, staged: &Path) -> Result<()> {
        let mut missing: Vec<PathBuf> = staged
            .ancestors()
            .take_while(|dir| *dir != self.stage)
            .map(Path::to_path_buf)
            .collect();
        missing.reverse();
        for dir in missing {
            if !self.dirs.contains(&dir) {
                self.steps.push(Step::Dir(cstring(&dir)?));
                self.dirs.push(dir);
            }
        }
        Ok(())
    }

    fn bind(&mut self, host: &Path, is_dir: bool) -> Result<()> {
        let staged = self.staged(host);
        if is_dir {
            self.dirs_to(&staged)?;
        } else {
            if let Some(parent) = staged.parent() {
                self.dirs_to(parent)?;
            }
            self.steps.push(Step::File(cstring(&staged)?));
        }
        self.steps.push(Step::Bind {
            source: cstring(host)?,
            target: cstring(&staged)?,
            flags: read_only_flags(host)?,
        });
        Ok(())
    }

    fn symlink(&mut self, target: &Path, host: &Path) -> Result<()> {
        let staged = self.staged(host);
        if let Some(parent) = staged.parent() {
            self.dirs_to(parent)?;
        }
        self.steps.push(Step::Symlink {
            target: cstring(target)?,
            link: cstring(&staged)?,
        });
        Ok(())
    }
}

fn ensure_stage(stage: &Path) -> Result<()> {
    if !stage.is_absolute() {
        return Err(SandboxError::Config(format!(
            "mount stage must be an absolute path: {}",
            stage.display()
        )));
    }
    match fs::symlink_metadata(stage) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(SandboxError::Config(format!(
            "mount stage {} is not a directory",
            stage.display()
        ))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(stage)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Remount flags for a read-only bind of `host`.
///
/// Inside a user namespace the kernel refuses to clear flags inherited from
/// the host mount, so the host's exec and atime flags are carried over.
fn read_only_flags(host: &Path) -> Result<libc::c_ulong> {
    let path = cstring(host)?;
    // SAFETY: statvfs is plain old data; all-zero is a valid value.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: statvfs reads a NUL-terminated path and writes into `stat` only.
    if unsafe { libc::statvfs(path.as_ptr(), &mut stat) } != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(mount_flags_for(stat.f_flag))
}

fn mount_flags_for(st_flags: libc::c_ulong) -> libc::c_ulong {
    let mut flags = libc::MS_RDONLY | libc::MS_NOSUID | libc::MS_NODEV;
    if st_flags & libc::ST_NOEXEC != 0 {
        flags |= libc::MS_NOEXEC;
    }
    if st_flags & libc::ST_NOATIME != 0 {
        flags |= libc::MS_NOATIME;
    } else if st_flags & libc::ST_RELATIME != 0 {
        flags |= libc::MS_RELATIME;
    } else {
        flags |= libc::MS_STRICTATIME;
    }
    if st_flags & libc::ST_NODIRATIME != 0 {
        flags |= libc::MS_NODIRATIME;
    }
    flags
}

fn sys_mount(
    source: Option<&CStr>,
    target: &CStr,
    fstype: Option<&CStr>,
    flags: libc::c_ulong,
    data: Option<&CStr>,
) -> io::Result<()> {
    let ptr = |s: Option<&CStr>| s.map_or(std::ptr::null(), CStr::as_ptr);
    // SAFETY: every pointer is null or a NUL-terminated string that outlives the call.
    let rc = unsafe { libc::mount(ptr(source), target.as_ptr(), ptr(fstype), flags, ptr(data).cast()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn make_dir(path: &CStr) -> io::Result<()> {
    // SAFETY: mkdir reads a NUL-terminated path.
    if unsafe { libc::mkdir(path.as_ptr(), 0o755) } != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(err);
        }
    }
    Ok(())
}

fn make_file(path: &CStr) -> io::Result<()> {
    // SAFETY: open reads a NUL-terminated path; the descriptor is closed below.
    let fd = unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_CREAT | libc::O_WRONLY | libc::O_CLOEXEC,
            0o444 as libc::c_uint,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd was just opened and is owned here.
    unsafe { libc::close(fd) };
    Ok(())
}

fn cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(invalid_path)
}

fn invalid_path(e: std::ffi::NulError) -> SandboxError {
    SandboxError::Config(format!("Invalid path for mount plan: {}", e))
}

/// Whether `pid` runs in its own mount namespace under a root other than
/// the host's. `None` when either side cannot be read.
pub fn filesystem_isolated(pid: u32) -> Option<bool> {
    let own = namespace::namespace_id("self", "mnt")?;
    let child = namespace::namespace_id(&pid.to_string(), "mnt")?;
    if own == child {
        return Some(false);
    }
    let host_root = fs::metadata("/").ok()?;
    let child_root = fs::metadata(format!("/proc/{}/root", pid)).ok()?;
    Some((host_root.dev(), host_root.ino()) != (child_root.dev(), child_root.ino()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(scratch: Option<&Path>) -> (tempfile::TempDir, FilesystemView) {
        let stage = tempfile::tempdir().unwrap();
        let view = FilesystemView::plan(stage.path(), Path::new("/bin/sh"), scratch).unwrap();
        (stage, view)
    }

    #[test]
    fn host_data_directories_are_not_exposed() {
        let (_stage, view) = view(None);
        let exposed = view.exposed();
        assert!(exposed.iter().any(|p| p == "/usr"));
        for hidden in ["/etc", "/home", "/root", "/tmp", "/var", "/proc"] {
            assert!(!exposed.iter().any(|p| p == hidden), "{} exposed", hidden);
        }
        assert!(exposed.iter().all(|p| p != "/etc/passwd"));
        assert_eq!(view.workdir.as_bytes(), b"/");
    }

    #[test]
    fn scratch_dir_is_bound_at_its_own_path() {
        let scratch = tempfile::tempdir().unwrap();
        let (stage, view) = view(Some(scratch.path()));
        assert_eq!(view.workdir.as_bytes(), scratch.path().as_os_str().as_bytes());

        let expected = stage.path().join(scratch.path().strip_prefix("/").unwrap());
        let bind = view.steps.iter().find_map(|step| match step {
            Step::Bind { source, target, flags } if source.as_bytes() == scratch.path().as_os_str().as_bytes() => {
                Some((target.clone(), *flags))
            }
            _ => None,
        });
        let (planned, flags) = bind.expect("scratch bind planned");
        assert_eq!(planned.as_bytes(), expected.as_os_str().as_bytes());
        assert_ne!(flags & libc::MS_RDONLY, 0);

        // Every directory on the way down is created before the bind.
        let parent = cstring(expected.parent().unwrap()).unwrap();
        let dir_at = view.steps.iter().position(|s| *s == Step::Dir(parent.clone()));
        let bind_at = view
            .steps
            .iter()
            .position(|s| matches!(s, Step::Bind { target, .. } if *target == planned));
        assert!(dir_at.unwrap() < bind_at.unwrap());
    }

    #[test]
    fn directories_are_planned_once() {
        let (_stage, view) = view(None);
        let dirs: Vec<&CString> = view
            .steps
            .iter()
            .filter_map(|s| match s {
                Step::Dir(d) => Some(d),
                _ => None,
            })
            .collect();
        let mut unique = dirs.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(dirs.len(), unique.len());
    }

    #[test]
    fn inherited_mount_flags_are_kept() {
        let flags = mount_flags_for(libc::ST_NOEXEC | libc::ST_NOATIME);
        assert_ne!(flags & libc::MS_NOEXEC, 0);
        assert_ne!(flags & libc::MS_NOATIME, 0);
        assert_eq!(flags & libc::MS_STRICTATIME, 0);
        assert_ne!(flags & libc::MS_RDONLY, 0);

        assert_ne!(mount_flags_for(libc::ST_RELATIME) & libc::MS_RELATIME, 0);
        assert_ne!(mount_flags_for(0) & libc::MS_STRICTATIME, 0);
    }

    #[test]
    fn stage_must_be_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        fs::write(&file, b"x").unwrap();
        assert!(ensure_stage(&file).is_err());
        assert!(ensure_stage(Path::new("relative")).is_err());

        let fresh = dir.path().join("fresh");
        ensure_stage(&fresh).unwrap();
        assert!(fresh.is_dir());
    }

    #[test]
    fn own_process_is_not_isolated() {
        if let Some(isolated) = filesystem_isolated(std::process::id()) {
            assert!(!isolated);
        }
    }
}
