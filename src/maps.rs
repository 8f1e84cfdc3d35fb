use crate::eh_elf::{module_name_for, EhElfFn, EhElfModule, UnwinderResolution};
use byteorder::ReadBytesExt;
use log::{debug, warn};
use smallvec::SmallVec;
use std::fs::File;
use std::io;
use std::io::{ErrorKind, Seek};

const MAX_REGIONS_LEN: usize = 64;
const LINE_BUFFER_SIZE: usize = 1024;

/// Error building a [MemoryMapIndex]. Any failure leaves the index empty,
/// never partially built.
#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("cannot read mapping source: {0}")]
    Io(#[from] io::Error),

    #[error("malformed or excess mapping record {0}")]
    Format(usize),

    #[error("cannot load unwinder module: {0}")]
    Load(String),
}

/// How `init_*` treats a region whose companion unwinder module cannot be
/// loaded or lacks the entry symbol.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LoadPolicy {
    /// Fail the whole build. Reference behavior.
    #[default]
    Require,
    /// Keep the region; stepping inside it reports `NoUnwinder`.
    Optional,
}

/// One record of an explicitly supplied memory layout, as a remote-attach
/// transport would report it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub begin: u64,
    pub end: u64,
    pub offset: u64,
    pub path: String,
}

/// A contiguous, executable, file-backed address range belonging to one
/// loaded binary object, with its companion unwinder resolution.
#[derive(Debug)]
pub struct MappedRegion {
    /// Dense index equal to sorted position; diagnostics only.
    pub id: usize,
    pub begin: u64,
    pub end: u64,
    /// `addr - bias` is the corresponding offset inside the backing file.
    pub bias: u64,
    pub object_path: String,
    pub(crate) unwinder: UnwinderResolution,
}

impl MappedRegion {
    #[inline]
    pub fn contains(&self, ip: u64) -> bool {
        self.begin <= ip && ip < self.end
    }

    #[inline]
    pub fn has_unwinder(&self) -> bool {
        self.unwinder.entry().is_some()
    }

    #[inline]
    pub(crate) fn entry(&self) -> Option<EhElfFn> {
        self.unwinder.entry()
    }
}

/// Sorted table of the executable, file-backed regions of one target
/// process, each with its generated unwinder.
///
/// One index per unwound target; a host tracing several processes builds
/// several independent indexes. `lookup` is the per-frame hot path and is
/// read-only; rebuilds and clears take `&mut self`.
pub struct MemoryMapIndex {
    regions: SmallVec<[MappedRegion; MAX_REGIONS_LEN]>,
    policy: LoadPolicy,
}

impl Default for MemoryMapIndex {
    fn default() -> Self {
        Self::new(LoadPolicy::default())
    }
}

impl MemoryMapIndex {
    /// Creates an empty index. Populate it with one of the `init_*` calls.
    pub fn new(policy: LoadPolicy) -> Self {
        Self {
            regions: SmallVec::new(),
            policy,
        }
    }

    /// Builds the index for the current process from `/proc/self/maps`.
    pub fn init_local(&mut self) -> Result<(), InitError> {
        self.init_maps_file("/proc/self/maps")
    }

    /// Builds the index for the process `pid` from `/proc/<pid>/maps`.
    pub fn init_pid(&mut self, pid: libc::pid_t) -> Result<(), InitError> {
        self.init_maps_file(&format!("/proc/{}/maps", pid))
    }

    /// Builds the index from a caller-supplied layout. Pseudo-regions such
    /// as `[stack]` or `[vdso]` are skipped.
    pub fn init_from_entries(&mut self, entries: &[MapEntry]) -> Result<(), InitError> {
        self.clear();
        let mut regions = SmallVec::new();
        for e in entries {
            if e.path.starts_with('[') {
                continue;
            }
            regions.push(MappedRegion {
                id: 0,
                begin: e.begin,
                end: e.end,
                bias: e.begin.wrapping_sub(e.offset),
                object_path: e.path.clone(),
                unwinder: UnwinderResolution::NotLoaded,
            });
        }
        self.publish(regions)
    }

    pub(crate) fn init_maps_file(&mut self, path: &str) -> Result<(), InitError> {
        self.clear();
        let mut reader = MapsReader::open(path)?;
        let expected = reader.count_records()?;
        let regions = reader.read_regions(expected)?;
        self.publish(regions)
    }

    /// Resolves the region containing `ip`, or `None` if the index is not
    /// built or no region matches. O(log n), allocation-free.
    pub fn lookup(&self, ip: u64) -> Option<&MappedRegion> {
        let pos = self.regions.partition_point(|r| r.end <= ip);
        let region = self.regions.get(pos)?;
        if region.contains(ip) {
            Some(region)
        } else {
            None
        }
    }

    /// All built regions, ascending by `begin`.
    pub fn regions(&self) -> &[MappedRegion] {
        &self.regions
    }

    /// Releases every loaded unwinder module and resets to the empty state.
    /// Idempotent; a no-op on an index that was never built.
    pub fn clear(&mut self) {
        self.regions.clear();
    }

    /// Sorts, renumbers and attaches unwinders, then swaps the table in.
    fn publish(&mut self, mut regions: SmallVec<[MappedRegion; MAX_REGIONS_LEN]>) -> Result<(), InitError> {
        regions.sort_unstable_by_key(|r| r.begin);
        for (id, region) in regions.iter_mut().enumerate() {
            region.id = id;
            region.unwinder = self.resolve_unwinder(&region.object_path)?;
        }
        debug!("memory map index built: {} regions", regions.len());
        self.regions = regions;
        Ok(())
    }

    fn resolve_unwinder(&self, object_path: &str) -> Result<UnwinderResolution, InitError> {
        let name = match module_name_for(object_path) {
            Some(name) => name,
            None => return self.unresolved(object_path.to_string()),
        };
        let loaded = EhElfModule::open(&name).and_then(|module| {
            let entry = module.entry()?;
            Some(UnwinderResolution::Loaded {
                module: Some(module),
                entry,
            })
        });
        match loaded {
            Some(resolution) => Ok(resolution),
            None => self.unresolved(name),
        }
    }

    fn unresolved(&self, name: String) -> Result<UnwinderResolution, InitError> {
        match self.policy {
            LoadPolicy::Require => Err(InitError::Load(name)),
            LoadPolicy::Optional => {
                warn!("no unwinder module for {}", name);
                Ok(UnwinderResolution::LoadFailed)
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_region_for_test(&mut self, begin: u64, end: u64, bias: u64, unwinder: UnwinderResolution) {
        let id = self.regions.len();
        self.regions.push(MappedRegion {
            id,
            begin,
            end,
            bias,
            object_path: String::from("test-object"),
            unwinder,
        });
        self.regions.sort_unstable_by_key(|r| r.begin);
    }
}

/// Incremental reader over a `/proc/<pid>/maps`-style file.
struct MapsReader {
    file: File,
    buffer: [u8; LINE_BUFFER_SIZE],
}

struct RawRecord<'a> {
    begin: u64,
    end: u64,
    offset: u64,
    path: &'a str,
}

impl MapsReader {
    fn open(path: &str) -> io::Result<Self> {
        Ok(Self {
            file: File::open(path)?,
            buffer: [0u8; LINE_BUFFER_SIZE],
        })
    }

    /// Counts the records in the file, then rewinds. The kernel emits one
    /// record per line; a final unterminated line still counts.
    fn count_records(&mut self) -> io::Result<usize> {
        let mut count = 0;
        let mut last = b'\n';
        loop {
            match self.file.read_u8() {
                Ok(c) => {
                    if c == b'\n' {
                        count += 1;
                    }
                    last = c;
                }
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err),
            }
        }
        if last != b'\n' {
            count += 1;
        }
        self.file.rewind()?;
        Ok(count)
    }

    fn read_regions(&mut self, expected: usize) -> Result<SmallVec<[MappedRegion; MAX_REGIONS_LEN]>, InitError> {
        let mut regions = SmallVec::new();
        let mut record = 0;
        loop {
            let len = match self.read_line() {
                Ok(Some(len)) => len,
                Ok(None) => break,
                Err(err) if err.kind() == ErrorKind::InvalidData => return Err(InitError::Format(record + 1)),
                Err(err) => return Err(err.into()),
            };
            record += 1;
            // The count pass and the parse pass disagreeing means the
            // mapping source changed under us; surface it rather than
            // indexing a half-consistent layout.
            if record > expected {
                return Err(InitError::Format(record));
            }
            let line = std::str::from_utf8(&self.buffer[..len]).map_err(|_| InitError::Format(record))?;
            if let Some(raw) = parse_record(line).map_err(|_| InitError::Format(record))? {
                regions.push(MappedRegion {
                    id: 0,
                    begin: raw.begin,
                    end: raw.end,
                    bias: raw.begin.wrapping_sub(raw.offset),
                    object_path: raw.path.to_string(),
                    unwinder: UnwinderResolution::NotLoaded,
                });
            }
        }
        Ok(regions)
    }

    /// Reads one line into the buffer, without the newline. `None` at end
    /// of input; a final unterminated line is returned normally.
    fn read_line(&mut self) -> io::Result<Option<usize>> {
        let mut len = 0;
        loop {
            match self.file.read_u8() {
                Ok(b'\n') => return Ok(Some(len)),
                Ok(c) => {
                    if len >= LINE_BUFFER_SIZE {
                        return Err(ErrorKind::InvalidData.into());
                    }
                    self.buffer[len] = c;
                    len += 1;
                }
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                    return if len == 0 { Ok(None) } else { Ok(Some(len)) };
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Parses one maps record. `Ok(None)` for records outside our scope:
/// non-executable, anonymous (inode 0), or without a backing path.
/// `Err(())` for records that do not look like maps records at all.
fn parse_record(line: &str) -> Result<Option<RawRecord<'_>>, ()> {
    let mut fields = line.split_whitespace();
    let range = fields.next().ok_or(())?;
    let (begin, end) = range.split_once('-').ok_or(())?;
    let begin = u64::from_str_radix(begin, 16).map_err(|_| ())?;
    let end = u64::from_str_radix(end, 16).map_err(|_| ())?;
    if begin >= end {
        return Err(());
    }
    let perms = fields.next().ok_or(())?;
    let offset = u64::from_str_radix(fields.next().ok_or(())?, 16).map_err(|_| ())?;
    let _device = fields.next().ok_or(())?;
    let inode: u64 = fields.next().ok_or(())?.parse().map_err(|_| ())?;

    let executable = perms.as_bytes().get(2) == Some(&b'x');
    if !executable || inode == 0 {
        return Ok(None);
    }
    let path = match fields.next() {
        Some(path) => path,
        None => return Ok(None),
    };
    Ok(Some(RawRecord {
        begin,
        end,
        offset,
        path,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_maps(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("eh-elf-unwind-{}-{}", name, std::process::id()));
        std::fs::write(&path, content).unwrap();
        path
    }

    fn entry(begin: u64, end: u64, offset: u64, path: &str) -> MapEntry {
        MapEntry {
            begin,
            end,
            offset,
            path: path.to_string(),
        }
    }

    #[test]
    fn test_parse_executable_record() {
        let path = write_maps(
            "exec",
            "00400000-00401000 r-xp 00000000 08:01 1234  /bin/prog\n4000-5000 rw-p 00000000 00:00 0  [heap]\n",
        );
        let mut index = MemoryMapIndex::new(LoadPolicy::Optional);
        index.init_maps_file(path.to_str().unwrap()).unwrap();
        assert_eq!(index.regions().len(), 1);
        let region = &index.regions()[0];
        assert_eq!(region.begin, 0x400000);
        assert_eq!(region.end, 0x401000);
        assert_eq!(region.bias, 0x400000);
        assert_eq!(region.object_path, "/bin/prog");
        assert!(!region.has_unwinder());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_parse_skips_non_executable_and_anonymous() {
        let path = write_maps(
            "skip",
            "1000-2000 r--p 00000000 08:01 99  /bin/a\n\
             2000-3000 r-xp 00000000 08:01 0  /bin/b\n\
             3000-4000 r-xp 00001000 08:01 99  /bin/c\n\
             5000-6000 r-xp 00000000 00:00 0\n",
        );
        let mut index = MemoryMapIndex::new(LoadPolicy::Optional);
        index.init_maps_file(path.to_str().unwrap()).unwrap();
        assert_eq!(index.regions().len(), 1);
        assert_eq!(index.regions()[0].object_path, "/bin/c");
        assert_eq!(index.regions()[0].bias, 0x3000 - 0x1000);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_malformed_record() {
        let path = write_maps("bad", "this is not a maps record\n");
        let mut index = MemoryMapIndex::new(LoadPolicy::Optional);
        match index.init_maps_file(path.to_str().unwrap()) {
            Err(InitError::Format(1)) => {}
            other => panic!("expected Format(1), got {:?}", other),
        }
        assert!(index.regions().is_empty());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_missing_maps_file_is_io_error() {
        let mut index = MemoryMapIndex::new(LoadPolicy::Optional);
        match index.init_maps_file("/proc/definitely-no-such-pid/maps") {
            Err(InitError::Io(_)) => {}
            other => panic!("expected Io, got {:?}", other),
        }
    }

    #[test]
    fn test_local_maps_contains_own_code() {
        let mut index = MemoryMapIndex::new(LoadPolicy::Optional);
        index.init_local().unwrap();
        let ip = test_local_maps_contains_own_code as *const () as u64;
        let region = index.lookup(ip).expect("own code must be mapped");
        assert!(region.contains(ip));
    }

    #[test]
    fn test_entries_sorted_with_dense_ids() {
        let mut index = MemoryMapIndex::new(LoadPolicy::Optional);
        index
            .init_from_entries(&[
                entry(0x7000, 0x8000, 0x2000, "/lib/libz.so"),
                entry(0x1000, 0x2000, 0, "/bin/a"),
                entry(0x4000, 0x6000, 0x1000, "/lib/libc.so.6"),
            ])
            .unwrap();
        let regions = index.regions();
        assert_eq!(regions.len(), 3);
        for (id, region) in regions.iter().enumerate() {
            assert_eq!(region.id, id);
            if id > 0 {
                assert!(regions[id - 1].begin < region.begin);
            }
        }
        // begin - bias recovers the recorded file offset.
        assert_eq!(regions[0].begin - regions[0].bias, 0);
        assert_eq!(regions[1].begin - regions[1].bias, 0x1000);
        assert_eq!(regions[2].begin - regions[2].bias, 0x2000);
    }

    #[test]
    fn test_entries_skip_pseudo_regions() {
        let mut index = MemoryMapIndex::new(LoadPolicy::Optional);
        index
            .init_from_entries(&[
                entry(0x1000, 0x2000, 0, "[stack]"),
                entry(0x3000, 0x4000, 0, "[vdso]"),
                entry(0x5000, 0x6000, 0, "/bin/a"),
            ])
            .unwrap();
        assert_eq!(index.regions().len(), 1);
        assert_eq!(index.regions()[0].object_path, "/bin/a");
    }

    #[test]
    fn test_lookup_boundaries() {
        let mut index = MemoryMapIndex::new(LoadPolicy::Optional);
        index
            .init_from_entries(&[entry(0x1000, 0x2000, 0, "/bin/a"), entry(0x3000, 0x4000, 0, "/bin/b")])
            .unwrap();
        assert!(index.lookup(0xfff).is_none());
        assert_eq!(index.lookup(0x1000).unwrap().object_path, "/bin/a");
        assert_eq!(index.lookup(0x1fff).unwrap().object_path, "/bin/a");
        assert!(index.lookup(0x2000).is_none());
        assert!(index.lookup(0x2fff).is_none());
        assert_eq!(index.lookup(0x3000).unwrap().object_path, "/bin/b");
        assert!(index.lookup(0x4000).is_none());
        assert!(index.lookup(u64::MAX).is_none());
    }

    #[test]
    fn test_clear_is_idempotent() {
        let mut index = MemoryMapIndex::new(LoadPolicy::Optional);
        index.clear();
        index.clear();
        assert!(index.lookup(0x1000).is_none());
        index.init_from_entries(&[entry(0x1000, 0x2000, 0, "/bin/a")]).unwrap();
        assert!(index.lookup(0x1000).is_some());
        index.clear();
        index.clear();
        assert!(index.lookup(0x1000).is_none());
    }

    #[test]
    fn test_reinit_without_clear() {
        let mut index = MemoryMapIndex::new(LoadPolicy::Optional);
        index.init_from_entries(&[entry(0x1000, 0x2000, 0, "/bin/a")]).unwrap();
        index.init_from_entries(&[entry(0x3000, 0x4000, 0, "/bin/b")]).unwrap();
        assert!(index.lookup(0x1000).is_none());
        assert_eq!(index.lookup(0x3000).unwrap().object_path, "/bin/b");
        assert_eq!(index.regions().len(), 1);
    }

    #[test]
    fn test_lookup_from_concurrent_threads() {
        let mut index = MemoryMapIndex::new(LoadPolicy::Optional);
        index
            .init_from_entries(&[entry(0x1000, 0x2000, 0, "/bin/a"), entry(0x3000, 0x4000, 0, "/bin/b")])
            .unwrap();
        let index = &index;
        std::thread::scope(|s| {
            let a = s.spawn(move || index.lookup(0x1800).map(|r| r.id));
            let b = s.spawn(move || index.lookup(0x3800).map(|r| r.id));
            assert_eq!(a.join().unwrap(), Some(0));
            assert_eq!(b.join().unwrap(), Some(1));
        });
    }

    #[test]
    fn test_require_policy_fails_build() {
        let mut index = MemoryMapIndex::new(LoadPolicy::Require);
        match index.init_from_entries(&[entry(0x1000, 0x2000, 0, "/bin/no-such-object")]) {
            Err(InitError::Load(name)) => assert_eq!(name, "no-such-object.eh_elf.so"),
            other => panic!("expected Load, got {:?}", other),
        }
        assert!(index.regions().is_empty());
        assert!(index.lookup(0x1000).is_none());
    }
}
