//! Reader for the legacy rpm `Packages` database (Berkeley DB hash format).
//!
//! Only what is needed to pull package header blobs out of the file is
//! implemented: the metadata page, hash pages and overflow page chains. Each
//! package header is stored as an off-page value whose bytes are spread over a
//! chain of overflow pages.
//!
//! Page header (26 bytes): lsn(8) pgno(4) prev_pgno(4) next_pgno(4)
//! entries(2) hf_offset(2) level(1) type(1).

use anyhow::{anyhow, bail, Result};

const HASH_MAGIC: u32 = 0x0006_1561;
const MAGIC_OFFSET: usize = 12;
const PAGE_SIZE_OFFSET: usize = 20;
const LAST_PGNO_OFFSET: usize = 32;

const PAGE_HEADER_SIZE: usize = 26;
const NEXT_PGNO_OFFSET: usize = 16;
const ENTRIES_OFFSET: usize = 20;
const HF_OFFSET_OFFSET: usize = 22;
const TYPE_OFFSET: usize = 25;

const P_HASH_UNSORTED: u8 = 2;
const P_OVERFLOW: u8 = 7;
const P_HASH: u8 = 13;
const H_OFFPAGE: u8 = 3;

const VALID_PAGE_SIZES: &[usize] = &[512, 1024, 2048, 4096, 8192, 16384, 32768, 65536];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Little,
    Big,
}

struct Database<'a> {
    bytes: &'a [u8],
    order: ByteOrder,
    page_size: usize,
    last_page: usize,
}

impl<'a> Database<'a> {
    fn open(bytes: &'a [u8]) -> Result<Self> {
        let magic = bytes
            .get(MAGIC_OFFSET..MAGIC_OFFSET + 4)
            .ok_or_else(|| anyhow!("file too small to be a Berkeley DB database"))?;
        let magic = [magic[0], magic[1], magic[2], magic[3]];
        let order = if u32::from_le_bytes(magic) == HASH_MAGIC {
            ByteOrder::Little
        } else if u32::from_be_bytes(magic) == HASH_MAGIC {
            ByteOrder::Big
        } else {
            bail!("not a Berkeley DB hash database");
        };

        let mut db = Self {
            bytes,
            order,
            page_size: 0,
            last_page: 0,
        };

        let page_size = db.u32_at(PAGE_SIZE_OFFSET)? as usize;
        if !VALID_PAGE_SIZES.contains(&page_size) {
            bail!("invalid Berkeley DB page size: {}", page_size);
        }
        db.page_size = page_size;

        // Tolerate a header that claims more pages than the file holds.
        let pages_in_file = bytes.len() / page_size;
        if pages_in_file == 0 {
            bail!("Berkeley DB file holds no complete page");
        }
        let last_pgno = db.u32_at(LAST_PGNO_OFFSET)? as usize;
        db.last_page = last_pgno.min(pages_in_file - 1);

        Ok(db)
    }

    fn u16_at(&self, at: usize) -> Result<u16> {
        let b = self
            .bytes
            .get(at..at + 2)
            .ok_or_else(|| anyhow!("read past end of database at offset {}", at))?;
        Ok(match self.order {
            ByteOrder::Little => u16::from_le_bytes([b[0], b[1]]),
            ByteOrder::Big => u16::from_be_bytes([b[0], b[1]]),
        })
    }

    fn u32_at(&self, at: usize) -> Result<u32> {
        let b = self
            .bytes
            .get(at..at + 4)
            .ok_or_else(|| anyhow!("read past end of database at offset {}", at))?;
        let b = [b[0], b[1], b[2], b[3]];
        Ok(match self.order {
            ByteOrder::Little => u32::from_le_bytes(b),
            ByteOrder::Big => u32::from_be_bytes(b),
        })
    }

    fn page_start(&self, pgno: usize) -> Result<usize> {
        if pgno == 0 || pgno > self.last_page {
            bail!("page {} is out of range (last page {})", pgno, self.last_page);
        }
        Ok(pgno * self.page_size)
    }

    fn page_type(&self, start: usize) -> u8 {
        self.bytes[start + TYPE_OFFSET]
    }

    /// Follows an overflow chain starting at `pgno` and returns `length` bytes.
    fn read_overflow(&self, pgno: usize, length: usize) -> Result<Vec<u8>> {
        let capacity = self.page_size - PAGE_HEADER_SIZE;
        let mut value = Vec::with_capacity(length.min(self.bytes.len()));
        let mut current = pgno;
        let mut visited = 0;

        while current != 0 && value.len() < length {
            visited += 1;
            if visited > self.last_page {
                bail!("overflow chain starting at page {} loops", pgno);
            }

            let start = self.page_start(current)?;
            if self.page_type(start) != P_OVERFLOW {
                bail!("page {} is not an overflow page", current);
            }
            let next = self.u32_at(start + NEXT_PGNO_OFFSET)? as usize;
            let used = (self.u16_at(start + HF_OFFSET_OFFSET)? as usize).min(capacity);
            let data_start = start + PAGE_HEADER_SIZE;
            value.extend_from_slice(&self.bytes[data_start..data_start + used]);
            current = next;
        }

        if value.len() < length {
            bail!(
                "overflow chain starting at page {} ended after {} of {} bytes",
                pgno,
                value.len(),
                length
            );
        }
        value.truncate(length);
        Ok(value)
    }
}

/// Returns every off-page value stored in the hash database, in page order.
/// In an rpm `Packages` database these are the package header blobs.
pub fn read_values(bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
    let db = Database::open(bytes)?;
    let mut values = Vec::new();

    for pgno in 1..=db.last_page {
        let start = db.page_start(pgno)?;
        let page_type = db.page_type(start);
        if page_type != P_HASH && page_type != P_HASH_UNSORTED {
            continue;
        }

        // Index entries alternate key, value.
        let entries = db.u16_at(start + ENTRIES_OFFSET)? as usize;
        for index in (1..entries).step_by(2) {
            let item_offset = db.u16_at(start + PAGE_HEADER_SIZE + index * 2)? as usize;
            if item_offset + 12 > db.page_size {
                log::debug!("Skipping hash item with bad offset {} on page {}", item_offset, pgno);
                continue;
            }
            let item = start + item_offset;
            if db.bytes[item] != H_OFFPAGE {
                continue;
            }
            let overflow_pgno = db.u32_at(item + 4)? as usize;
            let length = db.u32_at(item + 8)? as usize;
            values.push(db.read_overflow(overflow_pgno, length)?);
        }
    }

    Ok(values)
}
