//! Persistent IPv4 lease store for the AHCP stateful server.
//!
//! Leases live as one file per address in a directory that may sit on a
//! network filesystem. `link(2)` is the only primitive relied upon for
//! mutual exclusion: `open` hard-links the lease file to a `.lock`
//! sibling, `create` goes through a pid-suffixed temporary that is linked
//! to the `.lock` name and from there to the final name. `O_EXCL` on the
//! final name is deliberately never used; it is not atomic over NFS.

use std::fmt::{self, Display};
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process;

use log::{debug, warn};

use rand_core::RngCore;

/// Requested lease times are clamped to this.
pub const MAX_LEASE_TIME: u16 = 3600;

/// How long an expired lease stays reserved for its previous holder.
pub const GRACE_TIME: u32 = 600;

/// Lease files untouched for this long past expiry are purged at startup.
pub const PURGE_TIME: u32 = 15 * 24 * 3600;

/// Longest accepted client identifier.
pub const MAX_CLIENT_ID: usize = 650;

/// Size of the in-memory client-id to address hint cache.
pub const MAX_HINTS: usize = 256;

const RECORD_MAGIC: [u8; 8] = *b"AHCP\0\0\0\0";
const RECORD_HEADER: usize = 16;
const MAX_RECORD: usize = 700;

#[derive(Debug)]
pub enum LeaseError {
    Io(io::Error),
    /// Another party holds the lock on the lease file.
    Locked,
    /// The lease file exists but does not parse.
    Corrupt,
    /// The stored client id does not match the caller.
    Mismatch,
    /// Every address in the range is leased out.
    Exhausted,
    /// The client id exceeds what a lease file can hold.
    OversizeId,
    /// The configured address range is empty or inverted.
    BadRange,
}

impl Display for LeaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "I/O error: {err}"),
            Self::Locked => write!(f, "Lease file locked"),
            Self::Corrupt => write!(f, "Corrupt lease file"),
            Self::Mismatch => write!(f, "Client id mismatch"),
            Self::Exhausted => write!(f, "Address range exhausted"),
            Self::OversizeId => write!(f, "Client id too long"),
            Self::BadRange => write!(f, "Bad address range"),
        }
    }
}

impl std::error::Error for LeaseError {}

impl From<io::Error> for LeaseError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// The lease database: an address range, the directory holding one file
/// per leased address, and a lossy in-memory hint cache steering repeat
/// clients back to their previous address.
pub struct LeaseStore<R> {
    dir: PathBuf,
    first: u32,
    last: u32,
    hints: Vec<(Box<[u8]>, Ipv4Addr)>,
    rng: R,
}

impl<R> LeaseStore<R>
where
    R: RngCore,
{
    /// Opens the store and sweeps the directory: long-stale records are
    /// unlinked, healthy ones seed the hint cache.
    pub fn open(
        dir: impl Into<PathBuf>,
        first: Ipv4Addr,
        last: Ipv4Addr,
        now: u32,
        rng: R,
    ) -> Result<Self, LeaseError> {
        let first = u32::from(first);
        let last = u32::from(last);

        if first == 0 || first > last {
            return Err(LeaseError::BadRange);
        }

        let mut store = Self {
            dir: dir.into(),
            first,
            last,
            hints: Vec::new(),
            rng,
        };

        store.sweep(now)?;

        Ok(store)
    }

    /// Grants or renews a lease. Scans circularly starting from the
    /// suggested address, the client's hint, or the start of the range,
    /// and returns the chosen address with the granted lease time.
    pub fn take(
        &mut self,
        client_id: &[u8],
        suggested: Option<Ipv4Addr>,
        lease_time: u16,
        now: u32,
    ) -> Result<(Ipv4Addr, u16), LeaseError> {
        if client_id.len() > MAX_CLIENT_ID {
            return Err(LeaseError::OversizeId);
        }

        let time = lease_time.min(MAX_LEASE_TIME);

        let start = suggested
            .map(u32::from)
            .filter(|a| (self.first..=self.last).contains(a))
            .or_else(|| self.hint(client_id).map(u32::from))
            .unwrap_or(self.first);

        let mut addr = start;
        loop {
            let candidate = Ipv4Addr::from(addr);

            match self.get_lease(candidate, time, client_id, now) {
                Ok(()) => {
                    self.hint_insert(client_id, candidate);

                    return Ok((candidate, time));
                }
                Err(err) => debug!("Skipping {candidate}: {err}"),
            }

            addr = if addr >= self.last {
                self.first
            } else {
                addr + 1
            };
            if addr == start {
                return Err(LeaseError::Exhausted);
            }
        }
    }

    /// Returns a lease ahead of its expiry. The record is kept with
    /// `lease_end = now` so the grace window still deters immediate
    /// reuse by somebody else.
    pub fn release(
        &mut self,
        ipv4: Option<Ipv4Addr>,
        client_id: &[u8],
        now: u32,
    ) -> Result<(), LeaseError> {
        let Some(ipv4) = ipv4.or_else(|| self.hint(client_id)) else {
            return Ok(());
        };

        let path = self.lease_path(ipv4);
        let mut locked = LockedFile::open(&path).map_err(lock_error)?;

        let record = locked.read(ipv4)?;
        if record.client_id != client_id {
            return Err(LeaseError::Mismatch);
        }

        if locked.set_end(now).is_err() {
            fs::remove_file(&path)?;
        }

        locked.close()?;

        Ok(())
    }

    fn get_lease(
        &mut self,
        ipv4: Ipv4Addr,
        time: u16,
        client_id: &[u8],
        now: u32,
    ) -> Result<(), LeaseError> {
        let path = self.lease_path(ipv4);
        let end = now + 1 + time as u32;

        match LockedFile::open(&path) {
            Ok(mut locked) => {
                let record = locked.read(ipv4)?;

                if record.client_id == client_id {
                    locked.set_end(end)?;
                    locked.close()?;

                    Ok(())
                } else if record.lease_end.saturating_add(GRACE_TIME) < now {
                    // The previous holder is long gone; recycle the slot
                    fs::remove_file(&path)?;
                    locked.close()?;

                    self.create_lease(&path, ipv4, end, client_id)
                } else {
                    Err(LeaseError::Mismatch)
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.create_lease(&path, ipv4, end, client_id)
            }
            Err(err) => Err(lock_error(err)),
        }
    }

    fn create_lease(
        &mut self,
        path: &Path,
        ipv4: Ipv4Addr,
        end: u32,
        client_id: &[u8],
    ) -> Result<(), LeaseError> {
        let mut locked = LockedFile::create(path).map_err(lock_error)?;

        locked.write_record(ipv4, end, client_id)?;
        locked.close()?;

        Ok(())
    }

    fn sweep(&mut self, now: u32) -> Result<(), LeaseError> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;

            // Locks, pid temporaries and anything else that is not a
            // dotted quad is none of our business.
            let name = entry.file_name();
            let Some(ipv4) = name.to_str().and_then(|s| s.parse::<Ipv4Addr>().ok()) else {
                continue;
            };

            if let Err(err) = self.sweep_one(ipv4, now) {
                warn!("Skipping lease {ipv4} during sweep: {err}");
            }
        }

        Ok(())
    }

    fn sweep_one(&mut self, ipv4: Ipv4Addr, now: u32) -> Result<(), LeaseError> {
        let path = self.lease_path(ipv4);
        let mut locked = LockedFile::open(&path).map_err(lock_error)?;

        let record = locked.read(ipv4)?;

        if record.lease_end.saturating_add(PURGE_TIME) < now {
            debug!("Purging stale lease {ipv4}");
            fs::remove_file(&path)?;
        } else {
            let id = record.client_id.clone();
            self.hint_insert(&id, ipv4);
        }

        locked.close()?;

        Ok(())
    }

    fn lease_path(&self, ipv4: Ipv4Addr) -> PathBuf {
        self.dir.join(ipv4.to_string())
    }

    fn hint(&self, client_id: &[u8]) -> Option<Ipv4Addr> {
        self.hints
            .iter()
            .find(|(id, _)| **id == *client_id)
            .map(|(_, ipv4)| *ipv4)
    }

    fn hint_insert(&mut self, client_id: &[u8], ipv4: Ipv4Addr) {
        if let Some(slot) = self.hints.iter_mut().find(|(id, _)| **id == *client_id) {
            slot.1 = ipv4;
            return;
        }

        if self.hints.len() >= MAX_HINTS {
            let victim = self.rng.next_u32() as usize % self.hints.len();
            self.hints.swap_remove(victim);
        }

        self.hints.push((client_id.into(), ipv4));
    }
}

fn lock_error(err: io::Error) -> LeaseError {
    if err.kind() == io::ErrorKind::AlreadyExists {
        LeaseError::Locked
    } else {
        LeaseError::Io(err)
    }
}

struct LeaseRecord {
    lease_end: u32,
    client_id: Vec<u8>,
}

/// A lease file held under the `.lock` discipline. Dropping it releases
/// the lock; `close` additionally flushes the file to stable storage.
struct LockedFile {
    file: fs::File,
    lock: PathBuf,
}

impl LockedFile {
    fn open(path: &Path) -> io::Result<Self> {
        let lock = sibling(path, ".lock");

        fs::hard_link(path, &lock)?;

        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => Ok(Self { file, lock }),
            Err(err) => {
                let _ = fs::remove_file(&lock);
                Err(err)
            }
        }
    }

    fn create(path: &Path) -> io::Result<Self> {
        let lock = sibling(path, ".lock");
        let temp = sibling(path, &format!(".{}", process::id()));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&temp)?;

        if let Err(err) = fs::hard_link(&temp, &lock) {
            let _ = fs::remove_file(&temp);
            return Err(err);
        }

        let _ = fs::remove_file(&temp);

        if let Err(err) = fs::hard_link(&lock, path) {
            let _ = fs::remove_file(&lock);
            return Err(err);
        }

        Ok(Self { file, lock })
    }

    fn read(&mut self, ipv4: Ipv4Addr) -> Result<LeaseRecord, LeaseError> {
        let mut buf = [0; MAX_RECORD];

        self.file.seek(SeekFrom::Start(0))?;
        let len = self.file.read(&mut buf)?;

        if len < RECORD_HEADER || len >= MAX_RECORD {
            return Err(LeaseError::Corrupt);
        }

        if buf[..8] != RECORD_MAGIC {
            return Err(LeaseError::Corrupt);
        }

        if buf[8..12] != ipv4.octets() {
            return Err(LeaseError::Corrupt);
        }

        let lease_end = u32::from_be_bytes(buf[12..16].try_into().unwrap());

        Ok(LeaseRecord {
            lease_end,
            client_id: buf[RECORD_HEADER..len].to_vec(),
        })
    }

    fn write_record(
        &mut self,
        ipv4: Ipv4Addr,
        end: u32,
        client_id: &[u8],
    ) -> Result<(), LeaseError> {
        if client_id.len() > MAX_CLIENT_ID {
            return Err(LeaseError::OversizeId);
        }

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&RECORD_MAGIC)?;
        self.file.write_all(&ipv4.octets())?;
        self.file.write_all(&end.to_be_bytes())?;
        self.file.write_all(client_id)?;

        Ok(())
    }

    fn set_end(&mut self, end: u32) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(12))?;
        self.file.write_all(&end.to_be_bytes())
    }

    fn close(self) -> io::Result<()> {
        self.file.sync_all()
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock);
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);

    name.into()
}

#[cfg(test)]
mod test {
    use super::*;

    use rand::rngs::mock::StepRng;

    const NOW: u32 = 1_300_000_000;

    fn store(dir: &Path, first: [u8; 4], last: [u8; 4]) -> LeaseStore<StepRng> {
        LeaseStore::open(
            dir,
            first.into(),
            last.into(),
            NOW,
            StepRng::new(0, 1),
        )
        .unwrap()
    }

    fn read_end(dir: &Path, ipv4: Ipv4Addr) -> u32 {
        let data = fs::read(dir.join(ipv4.to_string())).unwrap();
        u32::from_be_bytes(data[12..16].try_into().unwrap())
    }

    #[test]
    fn same_client_keeps_its_address() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path(), [10, 0, 0, 10], [10, 0, 0, 20]);

        let (a, time) = store.take(b"client-1", None, 600, NOW).unwrap();
        assert_eq!(time, 600);
        let end1 = read_end(dir.path(), a);

        let (b, _) = store.take(b"client-1", None, 600, NOW + 100).unwrap();
        assert_eq!(a, b);

        // Renewed in place, lease_end rewritten
        let end2 = read_end(dir.path(), a);
        assert_eq!(end1, NOW + 601);
        assert_eq!(end2, NOW + 701);
    }

    #[test]
    fn distinct_clients_get_distinct_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path(), [10, 0, 0, 10], [10, 0, 0, 20]);

        let (a, _) = store.take(b"client-1", None, 600, NOW).unwrap();
        let (b, _) = store.take(b"client-2", None, 600, NOW).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn grace_window_blocks_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path(), [10, 0, 0, 10], [10, 0, 0, 20]);

        let (a, _) = store.take(b"client-1", None, 0, NOW).unwrap();
        store.release(Some(a), b"client-1", NOW).unwrap();
        assert_eq!(read_end(dir.path(), a), NOW);

        // 300 s after release: still inside the grace window
        let (b, _) = store
            .take(b"client-2", Some(a), 600, NOW + 300)
            .unwrap();
        assert_ne!(a, b);

        // 601 s after release: the slot is up for grabs again
        let (c, _) = store
            .take(b"client-3", Some(a), 600, NOW + 601)
            .unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn release_requires_the_right_client() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path(), [10, 0, 0, 10], [10, 0, 0, 20]);

        let (a, _) = store.take(b"client-1", None, 600, NOW).unwrap();

        assert!(matches!(
            store.release(Some(a), b"intruder", NOW),
            Err(LeaseError::Mismatch)
        ));
        assert!(store.release(Some(a), b"client-1", NOW).is_ok());
    }

    #[test]
    fn range_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path(), [10, 0, 0, 10], [10, 0, 0, 11]);

        store.take(b"client-1", None, 600, NOW).unwrap();
        store.take(b"client-2", None, 600, NOW).unwrap();

        assert!(matches!(
            store.take(b"client-3", None, 600, NOW),
            Err(LeaseError::Exhausted)
        ));
    }

    #[test]
    fn lease_time_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path(), [10, 0, 0, 10], [10, 0, 0, 20]);

        let (_, time) = store.take(b"client-1", None, u16::MAX, NOW).unwrap();
        assert_eq!(time, MAX_LEASE_TIME);
    }

    #[test]
    fn suggestions_outside_the_range_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path(), [10, 0, 0, 10], [10, 0, 0, 20]);

        let (a, _) = store
            .take(b"client-1", Some([192, 168, 1, 1].into()), 600, NOW)
            .unwrap();
        assert_eq!(a, Ipv4Addr::new(10, 0, 0, 10));
    }

    #[test]
    fn locked_slots_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path(), [10, 0, 0, 10], [10, 0, 0, 20]);

        let (a, _) = store.take(b"client-1", None, 600, NOW).unwrap();

        // Simulate a concurrent holder of the first slot's lock
        let path = dir.path().join(a.to_string());
        fs::hard_link(&path, sibling(&path, ".lock")).unwrap();

        let (b, _) = store.take(b"client-1", None, 600, NOW).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn oversize_client_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path(), [10, 0, 0, 10], [10, 0, 0, 20]);

        let id = vec![0xAA; MAX_CLIENT_ID + 1];
        assert!(matches!(
            store.take(&id, None, 600, NOW),
            Err(LeaseError::OversizeId)
        ));
    }

    #[test]
    fn sweep_purges_the_long_dead_and_hints_the_living() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut store = store(dir.path(), [10, 0, 0, 10], [10, 0, 0, 20]);
            store.take(b"stale", None, 600, NOW).unwrap();
            store.take(b"alive", None, 600, NOW).unwrap();
        }

        // Age the first record past the purge horizon by hand
        let stale = dir.path().join("10.0.0.10");
        let mut data = fs::read(&stale).unwrap();
        data[12..16].copy_from_slice(&(NOW - 1).to_be_bytes());
        fs::write(&stale, &data).unwrap();

        let later = NOW + PURGE_TIME;
        let mut store = LeaseStore::open(
            dir.path(),
            Ipv4Addr::new(10, 0, 0, 10),
            Ipv4Addr::new(10, 0, 0, 20),
            later,
            StepRng::new(0, 1),
        )
        .unwrap();

        assert!(!stale.exists());

        // The healthy record steers its client straight back
        let (addr, _) = store.take(b"alive", None, 600, later).unwrap();
        assert_eq!(addr, Ipv4Addr::new(10, 0, 0, 11));
    }

    #[test]
    fn bad_ranges_are_refused() {
        let dir = tempfile::tempdir().unwrap();

        assert!(matches!(
            LeaseStore::open(
                dir.path(),
                Ipv4Addr::new(10, 0, 0, 20),
                Ipv4Addr::new(10, 0, 0, 10),
                NOW,
                StepRng::new(0, 1),
            ),
            Err(LeaseError::BadRange)
        ));
    }
}
