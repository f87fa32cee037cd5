//! The files the daemon keeps around: its unique identity, the authority
//! body, the pid file and the log file.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use log::warn;

use rand_core::RngCore;

use ahcp_proto::MAX_BODY;

/// Loads the persistent 16-byte identity, minting and saving a fresh one
/// if the file is missing or short. A failure to persist is logged but
/// not fatal; the id is simply session-scoped then.
pub fn load_unique_id(path: &Path, rng: &mut impl RngCore) -> [u8; 16] {
    if let Ok(data) = fs::read(path) {
        if data.len() >= 16 {
            return data[..16].try_into().unwrap();
        }
    }

    let mut id = [0; 16];
    rng.fill_bytes(&mut id);

    if let Err(err) = fs::write(path, id) {
        warn!("Couldn't persist unique id to {}: {err}", path.display());
        let _ = fs::remove_file(path);
    }

    id
}

/// Reads the authority file: a raw option body, no packet header.
pub fn load_authority_body(path: &Path) -> io::Result<Vec<u8>> {
    let data = fs::read(path)?;

    if data.len() > MAX_BODY {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "authority body too large",
        ));
    }

    Ok(data)
}

pub fn write_pid_file(path: &Path) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;

    writeln!(file, "{}", std::process::id())
}

pub fn remove_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}

/// (Re)opens the log file and points stdout and stderr at it. Called at
/// startup when a log file is configured and again on reload, so rotated
/// logs pick up a fresh file.
pub fn reopen_log_file(path: &Path) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let file = OpenOptions::new().create(true).append(true).open(path)?;

    for fd in [1, 2] {
        if unsafe { libc::dup2(file.as_raw_fd(), fd) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    use rand::rngs::mock::StepRng;

    #[test]
    fn unique_id_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unique-id");

        let mut rng = StepRng::new(0x1234_5678_9ABC_DEF0, 1);
        let first = load_unique_id(&path, &mut rng);

        let mut rng = StepRng::new(0, 1);
        let second = load_unique_id(&path, &mut rng);

        assert_eq!(first, second);
        assert_eq!(fs::read(&path).unwrap(), first);
    }

    #[test]
    fn short_identity_files_are_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unique-id");
        fs::write(&path, [1, 2, 3]).unwrap();

        let mut rng = StepRng::new(7, 1);
        load_unique_id(&path, &mut rng);

        assert_eq!(fs::read(&path).unwrap().len(), 16);
    }

    #[test]
    fn oversized_authority_bodies_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authority");
        fs::write(&path, vec![0; MAX_BODY + 1]).unwrap();

        assert!(load_authority_body(&path).is_err());
    }

    #[test]
    fn pid_file_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pid");

        write_pid_file(&path).unwrap();
        assert!(write_pid_file(&path).is_err());

        remove_pid_file(&path);
        assert!(!path.exists());
    }
}
