//! Facts about the machine the provisioner runs on.

use std::collections::HashMap;
use std::env;
use std::ffi::{CStr, CString};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;

/// Host tools the bare-metal sequence relies on, as (command, package).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("apt-get", "apt"),
    ("cmake", "cmake"),
    ("make", "make"),
    ("c++", "build-essential"),
];

/// True when running with an effective uid of 0.
pub fn is_privileged() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

pub fn current_user() -> String {
    whoami::username()
}

/// An account from the user database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

/// The account that started g4up through `sudo`, if any.
pub fn sudo_account() -> Option<Account> {
    let name = env::var("SUDO_USER").ok().filter(|name| !name.is_empty())?;
    let account = lookup_account(&name);
    if account.is_none() {
        tracing::warn!(user = %name, "SUDO_USER not found in the user database");
    }
    account
}

/// Look `name` up through NSS, so directory-service users resolve too.
pub fn lookup_account(name: &str) -> Option<Account> {
    let c_name = CString::new(name).ok()?;
    let mut buf: Vec<libc::c_char> = vec![0; 16 * 1024];
    // SAFETY: a zeroed passwd is a valid out-parameter for getpwnam_r.
    let mut entry: libc::passwd = unsafe { std::mem::zeroed() };
    let mut found: *mut libc::passwd = std::ptr::null_mut();

    // SAFETY: every pointer is valid for the call; the strings written into
    // `entry` point into `buf`, which outlives their use below.
    let rc = unsafe {
        libc::getpwnam_r(
            c_name.as_ptr(),
            &mut entry,
            buf.as_mut_ptr(),
            buf.len(),
            &mut found,
        )
    };
    if rc != 0 || found.is_null() || entry.pw_dir.is_null() {
        return None;
    }

    // SAFETY: pw_dir is a NUL-terminated string inside `buf`.
    let home = unsafe { CStr::from_ptr(entry.pw_dir) }
        .to_string_lossy()
        .into_owned();
    Some(Account {
        name: name.to_string(),
        uid: entry.pw_uid,
        gid: entry.pw_gid,
        home: PathBuf::from(home),
    })
}

/// `path` and its ancestors that do not exist yet, deepest first.
pub fn missing_paths(path: &Path) -> Vec<PathBuf> {
    path.ancestors()
        .take_while(|ancestor| !ancestor.as_os_str().is_empty() && !ancestor.exists())
        .map(Path::to_path_buf)
        .collect()
}

/// Give `paths` to `account`.
pub fn hand_over(paths: &[PathBuf], account: &Account) -> io::Result<()> {
    for path in paths {
        std::os::unix::fs::chown(path, Some(account.uid), Some(account.gid))?;
    }
    Ok(())
}

pub fn cpu_count() -> usize {
    thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}

pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools from `tools` that are not on `PATH`.
pub fn missing_tools<'a>(tools: &[(&'a str, &'a str)]) -> Vec<(&'a str, &'a str)> {
    tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .copied()
        .collect()
}

/// Distribution ids from `/etc/os-release` (`ID` followed by `ID_LIKE`).
pub fn distribution_ids() -> Vec<String> {
    fs::read_to_string("/etc/os-release")
        .map(|contents| parse_os_release(&contents))
        .unwrap_or_default()
}

/// Whether the host looks like Debian or a derivative.
pub fn is_apt_based() -> bool {
    distribution_ids()
        .iter()
        .any(|id| id == "debian" || id == "ubuntu")
}

fn parse_os_release(contents: &str) -> Vec<String> {
    let mut values = HashMap::new();
    for line in contents.lines() {
        if let Some((key, value)) = line.split_once('=') {
            let trimmed = value.trim().trim_matches('"').to_ascii_lowercase();
            values.insert(key.trim().to_ascii_lowercase(), trimmed);
        }
    }

    let mut ids = Vec::new();
    if let Some(id) = values.get("id") {
        ids.push(id.clone());
    }
    if let Some(id_like) = values.get("id_like") {
        ids.extend(
            id_like
                .split(|c: char| c.is_ascii_whitespace() || c == ',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_string),
        );
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_exists() {
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_missing_tools() {
        let tools = &[("sh", "dash"), ("nonexistent_command_xyz", "fake-package")];
        assert_eq!(
            missing_tools(tools),
            vec![("nonexistent_command_xyz", "fake-package")]
        );
    }

    #[test]
    fn test_lookup_account_root() {
        let root = lookup_account("root").unwrap();
        assert_eq!(root.uid, 0);
        assert!(root.home.is_absolute());
        assert_eq!(lookup_account("no_such_user_g4up_xyz"), None);
    }

    #[test]
    fn test_missing_paths_stops_at_existing_ancestor() {
        let temp = tempfile::TempDir::new().unwrap();
        let rc = temp.path().join(".config/fish/config.fish");
        assert_eq!(
            missing_paths(&rc),
            vec![
                rc.clone(),
                temp.path().join(".config/fish"),
                temp.path().join(".config"),
            ]
        );
        assert!(missing_paths(temp.path()).is_empty());
    }

    #[test]
    fn test_hand_over_to_current_owner() {
        let temp = tempfile::TempDir::new().unwrap();
        let file = temp.path().join(".bashrc");
        fs::write(&file, "").unwrap();

        // SAFETY: getuid and getgid cannot fail.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        let account = Account {
            name: current_user(),
            uid,
            gid,
            home: temp.path().to_path_buf(),
        };
        hand_over(&[file], &account).unwrap();
    }

    #[test]
    fn test_cpu_count_is_positive() {
        assert!(cpu_count() >= 1);
    }

    #[test]
    fn test_parse_os_release_ubuntu() {
        let ids = parse_os_release(
            "NAME=\"Ubuntu\"\nID=ubuntu\nID_LIKE=debian\nVERSION_ID=\"22.04\"\n",
        );
        assert_eq!(ids, vec!["ubuntu", "debian"]);
    }

    #[test]
    fn test_parse_os_release_multiple_likes() {
        let ids = parse_os_release("ID=\"linuxmint\"\nID_LIKE=\"ubuntu debian\"\n");
        assert_eq!(ids, vec!["linuxmint", "ubuntu", "debian"]);
    }

    #[test]
    fn test_parse_os_release_fedora() {
        let ids = parse_os_release("ID=fedora\n");
        assert_eq!(ids, vec!["fedora"]);
    }
}
