//! Thin, error-propagating wrappers over the kernel operations the
//! isolation modules need.
//!
//! Every wrapper returns a [`SandboxError`] carrying the operation name, the
//! path involved, and the underlying errno, so failures deep in the child
//! setup still read well in logs. Attribute writes open-and-write in a
//! single operation and never leave a partial value behind.

use std::ffi::CString;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags};
use nix::sched::CloneFlags;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use sandbox_common::error::{Result, SandboxError};

fn io_err(path: &Path, source: std::io::Error) -> SandboxError {
    SandboxError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn sys_err(operation: &'static str, path: Option<&Path>, source: nix::errno::Errno) -> SandboxError {
    SandboxError::Syscall {
        operation,
        path: path.map(Path::to_path_buf),
        source,
    }
}

/// Reads a file to a string.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| io_err(path, e))
}

/// Writes `content` to `path` in a single open-and-write operation,
/// creating the file if necessary.
///
/// # Errors
///
/// Returns an error if the file cannot be created or written.
pub fn write_file(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content).map_err(|e| io_err(path, e))
}

/// Creates `path` and every missing prefix with mode 0755.
///
/// # Errors
///
/// Returns an error if any component cannot be created.
pub fn mkdir_recursive(path: &Path) -> Result<()> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)
        .map_err(|e| io_err(path, e))
}

/// Removes a directory tree.
///
/// # Errors
///
/// Returns an error if removal fails.
pub fn remove_tree(path: &Path) -> Result<()> {
    std::fs::remove_dir_all(path).map_err(|e| io_err(path, e))
}

/// Returns true if `path` exists.
#[must_use]
pub fn exists(path: &Path) -> bool {
    path.exists()
}

/// Returns true if `path` is a directory.
#[must_use]
pub fn is_directory(path: &Path) -> bool {
    path.is_dir()
}

/// Wraps `mount(2)`.
///
/// # Errors
///
/// Returns an error carrying the target path and errno if the mount fails.
pub fn mount(
    source: Option<&Path>,
    target: &Path,
    fstype: Option<&str>,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    nix::mount::mount(source, target, fstype, flags, data)
        .map_err(|e| sys_err("mount", Some(target), e))
}

/// Wraps `umount2(2)`.
///
/// # Errors
///
/// Returns an error if the unmount fails.
pub fn unmount(target: &Path, flags: MntFlags) -> Result<()> {
    nix::mount::umount2(target, flags).map_err(|e| sys_err("umount2", Some(target), e))
}

/// Wraps `pivot_root(2)`.
///
/// # Errors
///
/// Returns an error if the pivot fails; `new_root` must be a mount point.
pub fn pivot_root(new_root: &Path, put_old: &Path) -> Result<()> {
    nix::unistd::pivot_root(new_root, put_old).map_err(|e| sys_err("pivot_root", Some(new_root), e))
}

/// Wraps `unshare(2)`.
///
/// # Errors
///
/// Returns an error if the kernel rejects the flag set.
pub fn unshare(flags: CloneFlags) -> Result<()> {
    nix::sched::unshare(flags).map_err(|e| sys_err("unshare", None, e))
}

/// Creates a child process with `clone(2)`, entering the namespaces named
/// by `flags`. The callback runs in the child and its return value becomes
/// the child's exit status.
///
/// # Errors
///
/// Returns an error if the clone fails (e.g. `EPERM` for privileged
/// namespace flags without the matching capability).
pub fn clone_child(flags: CloneFlags, cb: Box<dyn FnMut() -> isize + '_>) -> Result<Pid> {
    const STACK_SIZE: usize = 1024 * 1024;
    let mut stack = vec![0u8; STACK_SIZE];
    // SAFETY: the child runs on its own copy of the address space (no
    // CLONE_VM), the stack buffer outlives the call, and the callback never
    // unwinds into parent frames.
    unsafe {
        nix::sched::clone(
            cb,
            &mut stack,
            flags,
            Some(Signal::SIGCHLD as libc::c_int),
        )
    }
    .map_err(|e| sys_err("clone", None, e))
}

/// Wraps `sethostname(2)`.
///
/// # Errors
///
/// Returns an error if the hostname cannot be set.
pub fn set_hostname(hostname: &str) -> Result<()> {
    nix::unistd::sethostname(hostname).map_err(|e| sys_err("sethostname", None, e))
}

/// Writes `/proc/self/setgroups`. Must happen before the GID map is written
/// in a new user namespace.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn write_setgroups(content: &str) -> Result<()> {
    write_file(Path::new("/proc/self/setgroups"), content)
}

/// Writes `/proc/self/uid_map`.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn write_uid_map(content: &str) -> Result<()> {
    write_file(Path::new("/proc/self/uid_map"), content)
}

/// Writes `/proc/self/gid_map`.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn write_gid_map(content: &str) -> Result<()> {
    write_file(Path::new("/proc/self/gid_map"), content)
}

/// Renames the calling process via `prctl(PR_SET_NAME)`. The kernel
/// truncates the name to 15 bytes.
///
/// # Errors
///
/// Returns an error if the name contains a NUL byte or the prctl fails.
pub fn set_process_name(name: &str) -> Result<()> {
    let cname = CString::new(name).map_err(|_| SandboxError::Config {
        message: format!("process name contains NUL byte: {name:?}"),
    })?;
    // SAFETY: PR_SET_NAME reads a NUL-terminated string from the pointer.
    let rc = unsafe { libc::prctl(libc::PR_SET_NAME, cname.as_ptr(), 0, 0, 0) };
    if rc < 0 {
        return Err(sys_err("prctl", None, nix::errno::Errno::last()));
    }
    Ok(())
}

/// Replaces the current process image with `command[0]`, passing the full
/// token sequence as argv. Only returns on failure.
///
/// # Errors
///
/// Returns an error if a token contains a NUL byte or `execv(2)` fails.
pub fn exec_command(command: &[String]) -> Result<std::convert::Infallible> {
    let argv: Vec<CString> = command
        .iter()
        .map(|arg| {
            CString::new(arg.as_str()).map_err(|_| SandboxError::Config {
                message: format!("command token contains NUL byte: {arg:?}"),
            })
        })
        .collect::<Result<_>>()?;
    nix::unistd::execv(&argv[0], &argv)
        .map_err(|e| sys_err("execv", Some(Path::new(&command[0])), e))
}

/// Joins a cgroup hierarchy root and a cgroup name into the full path.
#[must_use]
pub fn cgroup_path(hierarchy: &Path, name: &str) -> PathBuf {
    hierarchy.join(name)
}

/// Creates a cgroup directory under the hierarchy root.
///
/// # Errors
///
/// Returns an error if the directory cannot be created.
pub fn cgroup_create(hierarchy: &Path, name: &str) -> Result<()> {
    mkdir_recursive(&cgroup_path(hierarchy, name))
}

/// Removes a cgroup directory. The kernel only permits removal once the
/// cgroup has no member processes; control files do not count as contents.
///
/// # Errors
///
/// Returns an error if `rmdir(2)` fails.
pub fn cgroup_remove(hierarchy: &Path, name: &str) -> Result<()> {
    let path = cgroup_path(hierarchy, name);
    std::fs::remove_dir(&path).map_err(|e| io_err(&path, e))
}

/// Writes a cgroup attribute file (e.g. `memory.max`) in one operation.
///
/// # Errors
///
/// Returns an error if the attribute cannot be written.
pub fn cgroup_write(hierarchy: &Path, name: &str, attribute: &str, value: &str) -> Result<()> {
    write_file(&cgroup_path(hierarchy, name).join(attribute), value)
}

/// Enrolls a process into a cgroup by writing its pid to `cgroup.procs`.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn cgroup_add_pid(hierarchy: &Path, name: &str, pid: Pid) -> Result<()> {
    cgroup_write(hierarchy, name, "cgroup.procs", &pid.as_raw().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("value");

        write_file(&path, "42").expect("write");
        assert_eq!(read_file(&path).expect("read"), "42");
    }

    #[test]
    fn read_missing_file_is_io_error() {
        let result = read_file(Path::new("/nonexistent/sandbox/file"));
        assert!(matches!(result, Err(SandboxError::Io { .. })));
    }

    #[test]
    fn mkdir_recursive_creates_all_prefixes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let deep = dir.path().join("a").join("b").join("c");

        mkdir_recursive(&deep).expect("mkdir");
        assert!(is_directory(&deep));
        assert!(exists(&dir.path().join("a")));
    }

    #[test]
    fn mkdir_recursive_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("x");
        mkdir_recursive(&path).expect("first");
        mkdir_recursive(&path).expect("second");
    }

    #[test]
    fn remove_tree_deletes_nested_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("tree");
        mkdir_recursive(&root.join("nested")).expect("mkdir");
        write_file(&root.join("nested").join("file"), "x").expect("write");

        remove_tree(&root).expect("remove");
        assert!(!exists(&root));
    }

    #[test]
    fn cgroup_helpers_compose_filesystem_operations() {
        let dir = tempfile::tempdir().expect("tempdir");

        cgroup_create(dir.path(), "sandbox-test-1").expect("create");
        assert!(is_directory(&cgroup_path(dir.path(), "sandbox-test-1")));

        cgroup_write(dir.path(), "sandbox-test-1", "memory.max", "1048576").expect("write attr");
        let value = read_file(&dir.path().join("sandbox-test-1").join("memory.max"))
            .expect("read attr");
        assert_eq!(value, "1048576");

        cgroup_add_pid(dir.path(), "sandbox-test-1", Pid::from_raw(1234)).expect("add pid");
        let procs = read_file(&dir.path().join("sandbox-test-1").join("cgroup.procs"))
            .expect("read procs");
        assert_eq!(procs, "1234");
    }

    #[test]
    fn set_process_name_rejects_nul() {
        let result = set_process_name("bad\0name");
        assert!(matches!(result, Err(SandboxError::Config { .. })));
    }

    #[test]
    fn exec_command_rejects_nul_token() {
        let result = exec_command(&["/bin/echo".into(), "a\0b".into()]);
        assert!(matches!(result, Err(SandboxError::Config { .. })));
    }
}
