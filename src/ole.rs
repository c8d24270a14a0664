//! A minimal reader for the *Compound File Binary* container ([MS-CFB]) used to wrap
//! encrypted OOXML packages.
//!
//! Only what the decryption pipeline needs is implemented: opening the container,
//! looking up a root-level stream by name, and reading it in full. Unlike a general
//! purpose OLE2 reader this does not walk the whole directory tree, does not export a
//! digraph, and does not decode timestamps or property sets - none of that is needed to
//! pull `EncryptionInfo`/`EncryptedPackage` out of the container.
//!
//! Cosmetic deviations from [MS-CFB] (a non-null CLSID, a mismatched root entry name, a
//! wrong directory sector count) are tolerated and only logged; only deviations that make
//! the container impossible to navigate are fatal.

use crate::error::{Error, Result};
use crate::util::{rdu16le, rdu32le, umin};
use std::io::{Read, Seek, SeekFrom};

const ENDOFCHAIN: u32 = 0xfffffffe;
const FREESECT: u32 = 0xffffffff;
const MAXREGSID: u32 = 0xfffffffa;
const NOSTREAM: u32 = 0xffffffff;
const DIFSECT: u32 = 0xfffffffc;
const FATSECT: u32 = 0xfffffffd;

#[derive(Debug, Clone, Default)]
struct DirEntry {
    objtype: u8,
    name: String,
    left: u32,
    right: u32,
    child: u32,
    start_sector: u32,
    size: u64,
}

impl DirEntry {
    fn is_storage(&self) -> bool {
        self.objtype == 1 || self.objtype == 5
    }

    fn is_mini(&self) -> bool {
        self.size < 4096
    }
}

/// A parsed Compound File container, open over an in-memory buffer.
pub struct Ole<'a> {
    f: std::io::Cursor<&'a [u8]>,
    major_version: u16,
    sector_size: u32,
    fat: Vec<u32>,
    minifat: Vec<u32>,
    first_dir_sector: u32,
    dir_entries: u32,
    root: DirEntry,
}

impl<'a> Ole<'a> {
    /// Parses the Compound File header, FAT, MiniFAT and directory chain.
    pub fn open(bytes: &'a [u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::EmptyInput);
        }
        let mut f = std::io::Cursor::new(bytes);
        let mut header = [0u8; 8];
        f.read_exact(&mut header)
            .map_err(|_| Error::NotCompoundFile("buffer shorter than the CFB header".into()))?;
        if header != [0xd0, 0xcf, 0x11, 0xe0, 0xa1, 0xb1, 0x1a, 0xe1] {
            return Err(Error::NotCompoundFile("bad magic".into()));
        }

        let mut clsid = [0u8; 16];
        f.read_exact(&mut clsid)?;
        if clsid != [0u8; 16] {
            tracing::debug!("CFB header CLSID is not null");
        }

        let minor_version = rdu16le(&mut f)?;
        let major_version = rdu16le(&mut f)?;
        if !(3..=4).contains(&major_version) {
            return Err(Error::NotCompoundFile(format!(
                "unsupported CFB major version {major_version}"
            )));
        }
        if minor_version != 0x003e {
            tracing::debug!(minor_version, "non-standard CFB minor version");
        }

        let byte_order = rdu16le(&mut f)?;
        if byte_order != 0xfffe {
            return Err(Error::NotCompoundFile("bad byte order mark".into()));
        }

        let sector_shift = rdu16le(&mut f)?;
        let sector_size = match sector_shift {
            0x9 => 512u32,
            0xc => 4096u32,
            _ => {
                return Err(Error::NotCompoundFile(format!(
                    "invalid sector shift {sector_shift}"
                )))
            }
        };

        let _mini_sector_shift = rdu16le(&mut f)?;
        f.seek(SeekFrom::Current(6))?; // reserved

        let _dir_sectors = rdu32le(&mut f)?;
        let fat_sectors = rdu32le(&mut f)?;
        let first_dir_sector = rdu32le(&mut f)?;
        let _transaction_signature = rdu32le(&mut f)?;
        let _mini_cutoff = rdu32le(&mut f)?;
        let first_minifat_sector = rdu32le(&mut f)?;
        let minifat_sectors = rdu32le(&mut f)?;
        let first_difat_sector = rdu32le(&mut f)?;
        let difat_sectors = rdu32le(&mut f)?;

        let mut inline_difat = [0u8; 109 * 4];
        f.read_exact(&mut inline_difat)?;

        let mut ret = Self {
            f,
            major_version,
            sector_size,
            fat: Vec::new(),
            minifat: Vec::new(),
            first_dir_sector,
            dir_entries: 0,
            root: DirEntry::default(),
        };

        let mut difat = Vec::new();
        let mut difat_complete = add_difats_from_buf(&mut difat, &inline_difat)?;
        if !difat_complete && difat_sectors > 0 {
            let mut difat_sector = first_difat_sector;
            for _ in 0..difat_sectors {
                if difat_complete {
                    break;
                }
                let mut sec = ret.read_sector(difat_sector)?;
                let nextsec = sec.split_off(sec.len() - 4);
                difat_complete = add_difats_from_buf(&mut difat, &sec)?;
                difat_sector = u32::from_le_bytes(nextsec.try_into().unwrap());
            }
        }
        if !difat_complete && fat_sectors as usize != difat.len() {
            tracing::debug!(
                header_fat_sectors = fat_sectors,
                found = difat.len(),
                "FAT sector count mismatch between header and DIFAT"
            );
        }

        for difat_sector in &difat {
            let sec = ret.read_sector(*difat_sector)?;
            for v in sec.chunks_exact(4) {
                ret.fat.push(u32::from_le_bytes(v.try_into().unwrap()));
            }
        }

        ret.read_minifat(first_minifat_sector, minifat_sectors)?;
        ret.read_root()?;

        let mut count = 0u32;
        let mut next = first_dir_sector;
        loop {
            count += 1;
            match ret.get_next_sector(next) {
                Ok(n) => next = n,
                Err(ENDOFCHAIN) => break,
                Err(e) => {
                    return Err(Error::NotCompoundFile(format!(
                        "directory sector chain ended with special sector {e:#x}"
                    )))
                }
            }
        }
        ret.dir_entries = (sector_size / 128)
            .checked_mul(count)
            .ok_or_else(|| Error::NotCompoundFile("directory entry count overflow".into()))?;

        Ok(ret)
    }

    /// Reads a root-level stream entirely into memory.
    ///
    /// `name` must not contain a leading `/`; no storage traversal is supported since this
    /// crate only ever reads top-level streams (`EncryptionInfo`, `EncryptedPackage`).
    pub fn read_stream(&mut self, name: &'static str) -> Result<Vec<u8>> {
        let entry = self.find_entry(name)?;
        if entry.is_storage() {
            return Err(Error::MissingStream(name));
        }
        let mut out = Vec::with_capacity(entry.size as usize);
        let mut reader = StreamReader::new(self, &entry);
        reader
            .read_to_end(&mut out)
            .map_err(|e| Error::NotCompoundFile(format!("failed reading stream {name}: {e}")))?;
        Ok(out)
    }

    fn find_entry(&mut self, name: &'static str) -> Result<DirEntry> {
        let upper_target = name.to_uppercase();
        let mut nextid = self.root.child;
        let mut cur = DirEntry::default();
        let mut steps = 0u32;
        loop {
            if nextid > MAXREGSID {
                return Err(Error::MissingStream(name));
            }
            if steps >= self.dir_entries.max(1) * 4 {
                return Err(Error::NotCompoundFile(
                    "directory tree lookup did not terminate".into(),
                ));
            }
            cur = self.read_entry(nextid)?;
            let cname = cur.name.to_uppercase();
            steps += 1;
            nextid = match upper_target.cmp(&cname) {
                std::cmp::Ordering::Less => cur.left,
                std::cmp::Ordering::Greater => cur.right,
                std::cmp::Ordering::Equal => return Ok(cur),
            };
        }
    }

    fn read_root(&mut self) -> Result<()> {
        let root = self.read_entry(0)?;
        if root.objtype != 5 {
            return Err(Error::NotCompoundFile(format!(
                "root entry has type {} instead of 5",
                root.objtype
            )));
        }
        self.root = root;
        Ok(())
    }

    fn read_entry(&mut self, nentry: u32) -> Result<DirEntry> {
        let entries_per_sec = self.sector_size / 128;
        let sec = self.find_relative_sector(self.first_dir_sector, nentry / entries_per_sec)?;
        let off = (nentry % entries_per_sec) * 128;
        self.seek_sector(sec)?;
        self.f.seek(SeekFrom::Current(off.into()))?;
        let mut buf = [0u8; 128];
        self.f.read_exact(&mut buf)?;

        let objtype = buf[66];
        if objtype == 0 {
            return Ok(DirEntry {
                objtype: 0,
                left: NOSTREAM,
                right: NOSTREAM,
                child: NOSTREAM,
                ..Default::default()
            });
        }
        let namelen: usize = u16::from_le_bytes(buf[64..66].try_into().unwrap()).into();
        if namelen == 0 || namelen > 64 || namelen % 2 != 0 {
            return Err(Error::NotCompoundFile(format!(
                "invalid directory entry name length {namelen}"
            )));
        }
        let mut namebuf: Vec<u16> = buf[0..namelen]
            .chunks_exact(2)
            .map(|v| u16::from_le_bytes(v.try_into().unwrap()))
            .collect();
        namebuf.pop(); // trailing NUL
        let name = String::from_utf16(&namebuf)
            .map_err(|_| Error::NotCompoundFile("directory entry name is not UTF-16".into()))?;

        let left = u32::from_le_bytes(buf[68..72].try_into().unwrap());
        let right = u32::from_le_bytes(buf[72..76].try_into().unwrap());
        let child = u32::from_le_bytes(buf[76..80].try_into().unwrap());
        let start_sector = u32::from_le_bytes(buf[116..120].try_into().unwrap());
        let mut size = u64::from_le_bytes(buf[120..128].try_into().unwrap());
        if self.major_version == 3 {
            size &= 0xffff_ffff;
        }

        Ok(DirEntry {
            objtype,
            name,
            left,
            right,
            child,
            start_sector,
            size,
        })
    }

    fn read_sector(&mut self, sector_number: u32) -> Result<Vec<u8>> {
        self.seek_sector(sector_number)?;
        let mut buf = vec![0u8; self.sector_size as usize];
        self.f.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn seek_sector(&mut self, sector_number: u32) -> Result<()> {
        if sector_number > MAXREGSID {
            return Err(Error::NotCompoundFile(format!(
                "cannot seek to special sector {sector_number:#x}"
            )));
        }
        let offset = (u64::from(sector_number) + 1)
            .checked_mul(u64::from(self.sector_size))
            .ok_or_else(|| Error::NotCompoundFile("sector seek overflow".into()))?;
        self.f.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn seek_mini_sector(&mut self, mini_sector_number: u32) -> Result<()> {
        let stream_position = u64::from(mini_sector_number) * 64;
        let sector_number = self.find_relative_sector(
            self.root.start_sector,
            (stream_position / u64::from(self.sector_size)) as u32,
        )?;
        let sector_offset = (stream_position % u64::from(self.sector_size)) as u32;
        let absolute = (u64::from(sector_number) + 1) * u64::from(self.sector_size)
            + u64::from(sector_offset);
        self.f.seek(SeekFrom::Start(absolute))?;
        Ok(())
    }

    fn find_relative_sector(&mut self, first: u32, nsec: u32) -> Result<u32> {
        let mut ret = first;
        for _ in 0..nsec {
            ret = self
                .get_next_sector(ret)
                .map_err(|e| Error::NotCompoundFile(format!("FAT chain hit {e:#x}")))?;
        }
        Ok(ret)
    }

    fn get_next_sector(&self, sector: u32) -> std::result::Result<u32, u32> {
        let index = usize::try_from(sector).map_err(|_| 0u32)?;
        match self.fat.get(index) {
            Some(&next) if next > MAXREGSID => Err(next),
            Some(&next) => Ok(next),
            None => Err(0),
        }
    }

    fn get_next_mini_sector(&self, sector: u32) -> std::result::Result<u32, u32> {
        let index = usize::try_from(sector).map_err(|_| 0u32)?;
        match self.minifat.get(index) {
            Some(&next) if next > MAXREGSID => Err(next),
            Some(&next) => Ok(next),
            None => Err(0),
        }
    }

    fn read_minifat(&mut self, first: u32, count: u32) -> Result<()> {
        let mut cur = Ok(first);
        for _ in 0..count {
            cur = match cur {
                Ok(nsec) => {
                    let sec = self.read_sector(nsec)?;
                    for v in sec.chunks_exact(4) {
                        self.minifat.push(u32::from_le_bytes(v.try_into().unwrap()));
                    }
                    self.get_next_sector(nsec)
                }
                Err(e) => {
                    return Err(Error::NotCompoundFile(format!(
                        "MiniFAT chain ended unexpectedly with {e:#x}"
                    )))
                }
            };
        }
        Ok(())
    }
}

fn add_difats_from_buf(difat: &mut Vec<u32>, buf: &[u8]) -> Result<bool> {
    for chunk in buf.chunks_exact(4) {
        let v = u32::from_le_bytes(chunk.try_into().unwrap());
        match v {
            DIFSECT | FATSECT | ENDOFCHAIN => {
                return Err(Error::NotCompoundFile(format!(
                    "DIFAT sector with special offset {v:#x}"
                )))
            }
            FREESECT => return Ok(true),
            _ => difat.push(v),
        }
    }
    Ok(false)
}

struct StreamReader<'a, 'b> {
    ole: &'a mut Ole<'b>,
    current_sector: u32,
    is_mini: bool,
    size: u64,
    done: u64,
    data: Vec<u8>,
    dirty: bool,
    end_of_last_full_block: u64,
}

impl<'a, 'b> StreamReader<'a, 'b> {
    fn new(ole: &'a mut Ole<'b>, entry: &DirEntry) -> Self {
        let data_len = if entry.is_mini() { 64 } else { ole.sector_size as usize };
        let end_of_last_full_block = entry.size - (entry.size % data_len as u64);
        Self {
            ole,
            current_sector: entry.start_sector,
            is_mini: entry.is_mini(),
            size: entry.size,
            done: 0,
            data: vec![0; data_len],
            dirty: true,
            end_of_last_full_block,
        }
    }

    fn read_current_sector(&mut self) -> std::io::Result<()> {
        if self.is_mini {
            self.ole
                .seek_mini_sector(self.current_sector)
                .map_err(to_io)?;
        } else {
            self.ole.seek_sector(self.current_sector).map_err(to_io)?;
        }
        let remaining = if self.done >= self.end_of_last_full_block {
            (self.size - self.end_of_last_full_block) as usize
        } else {
            self.data.len()
        };
        self.ole.f.read_exact(&mut self.data[0..remaining])?;
        self.dirty = false;
        Ok(())
    }

    fn move_to_next_sector(&mut self) {
        self.current_sector = if self.is_mini {
            self.ole
                .get_next_mini_sector(self.current_sector)
                .unwrap_or(MAXREGSID + 1)
        } else {
            self.ole
                .get_next_sector(self.current_sector)
                .unwrap_or(MAXREGSID + 1)
        };
        self.dirty = true;
    }
}

fn to_io(e: Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
}

impl Read for StreamReader<'_, '_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut written = 0usize;
        while written < buf.len() && self.done < self.size {
            if self.current_sector > MAXREGSID {
                break;
            }
            if self.dirty {
                self.read_current_sector()?;
            }
            let avail_stream = self.size - self.done;
            let data_offset = (self.done as usize) % self.data.len();
            let avail_data = self.data.len() - data_offset;
            let avail_in = umin(avail_data, avail_stream);
            let avail_out = buf.len() - written;
            let copy_len = umin(avail_in, avail_out);
            buf[written..written + copy_len]
                .copy_from_slice(&self.data[data_offset..data_offset + copy_len]);
            written += copy_len;
            self.done += copy_len as u64;
            if (self.done as usize) % self.data.len() == 0 && self.done < self.size {
                self.move_to_next_sector();
            }
        }
        Ok(written)
    }
}
