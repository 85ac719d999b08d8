use std::io::{Read, Write};

use crate::errors::{Result, RumrfError};
use crate::LabelId;

/// An interning dictionary mapping strings to non-negative integer ids.
///
/// Strings live NUL-terminated in a flat byte arena; the id of a string is
/// its byte offset in the arena, so lookups by id are O(1) and the arena is
/// the persisted representation. A linear-probing table of offsets provides
/// lookup by content and is rebuilt when a dictionary is loaded.
#[derive(Clone, Debug, Default)]
pub struct StringDictionary {
    data: Vec<u8>,
    hashes: Vec<i32>,
    load: usize,
}

impl StringDictionary {
    /// Creates an empty dictionary.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a string and returns its id. Returns the existing id if the
    /// string is already present.
    pub fn add(&mut self, s: &str) -> LabelId {
        let hash = Self::string_hash(s.as_bytes());
        if let Some(id) = self.find_hashed(s.as_bytes(), hash) {
            return id;
        }
        let id = self.data.len() as LabelId;
        self.add_hash(hash, id);
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        id
    }

    /// Returns the id of a string, or `None` if it is not interned.
    #[must_use]
    pub fn find(&self, s: &str) -> Option<LabelId> {
        self.find_hashed(s.as_bytes(), Self::string_hash(s.as_bytes()))
    }

    /// Returns whether the dictionary contains a string.
    #[must_use]
    pub fn contains(&self, s: &str) -> bool {
        self.find(s).is_some()
    }

    /// Returns the string interned under an id.
    ///
    /// # Panics
    ///
    /// The id must have been returned by [`add`](Self::add) on this
    /// dictionary (or one restored from it).
    #[must_use]
    pub fn get(&self, id: LabelId) -> &str {
        let start = usize::try_from(id).unwrap();
        let bytes = &self.data[start..];
        let end = bytes.iter().position(|&b| b == 0).unwrap();
        // The arena only ever receives `&str` content (checked on load).
        std::str::from_utf8(&bytes[..end]).unwrap()
    }

    /// Returns the number of interned strings.
    #[must_use]
    pub fn num_entries(&self) -> usize {
        self.load
    }

    /// Returns the size of the backing arena in bytes. Ids at or above this
    /// value are free for request-local use.
    #[must_use]
    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    /// Enumerates `(id, string)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (LabelId, &str)> {
        DictionaryIter {
            dict: self,
            pos: 0,
        }
    }

    /// Writes the dictionary to a sink: the arena size, the arena bytes, and
    /// the hash-table size (a rebuild hint for the reader).
    pub fn save<W>(&self, wtr: &mut W) -> Result<()>
    where
        W: Write,
    {
        wtr.write_all(&(self.data.len() as i32).to_le_bytes())?;
        wtr.write_all(&self.data)?;
        wtr.write_all(&(self.hashes.len() as i32).to_le_bytes())?;
        Ok(())
    }

    /// Reads a dictionary previously written with [`save`](Self::save). The
    /// restored dictionary is bit-exact: every id maps to the same string.
    pub fn load<R>(rdr: &mut R) -> Result<Self>
    where
        R: Read,
    {
        let mut buf = [0u8; 4];
        rdr.read_exact(&mut buf)?;
        let data_size = i32::from_le_bytes(buf);
        let data_size = usize::try_from(data_size)
            .map_err(|_| RumrfError::model_format("negative dictionary size"))?;
        let mut data = vec![0u8; data_size];
        rdr.read_exact(&mut data)?;
        if data.last().is_some_and(|&b| b != 0) {
            return Err(RumrfError::model_format(
                "dictionary arena is not NUL-terminated",
            ));
        }
        if std::str::from_utf8(&data).is_err() {
            return Err(RumrfError::model_format("dictionary arena is not UTF-8"));
        }
        rdr.read_exact(&mut buf)?;
        let hint = i32::from_le_bytes(buf);
        let hint = usize::try_from(hint)
            .map_err(|_| RumrfError::model_format("negative hash table size"))?;

        let mut dict = Self {
            data,
            hashes: vec![-1; hint],
            load: 0,
        };
        dict.rehash_all();
        Ok(dict)
    }

    fn find_hashed(&self, s: &[u8], hash: u64) -> Option<LabelId> {
        if self.hashes.is_empty() {
            return None;
        }
        let mut p = (hash % self.hashes.len() as u64) as usize;
        while self.hashes[p] != -1 {
            let id = self.hashes[p];
            let start = id as usize;
            let stored = &self.data[start..start + s.len().min(self.data.len() - start)];
            if stored == s && self.data.get(start + s.len()) == Some(&0) {
                return Some(id);
            }
            p += 1;
            if p == self.hashes.len() {
                p = 0;
            }
        }
        None
    }

    fn string_hash(s: &[u8]) -> u64 {
        let mut hash = 5381u64;
        for &b in s {
            hash = (hash << 5).wrapping_add(hash).wrapping_add(u64::from(b));
        }
        hash.wrapping_mul(13)
    }

    fn add_hash(&mut self, hash: u64, id: i32) {
        while self.load * 2 >= self.hashes.len() {
            self.hashes = vec![-1; self.hashes.len() * 2 + 3];
            self.rehash_all();
        }
        self.add_hash_no_rehash(hash, id);
    }

    fn add_hash_no_rehash(&mut self, hash: u64, id: i32) {
        self.load += 1;
        let mut p = (hash % self.hashes.len() as u64) as usize;
        while self.hashes[p] != -1 {
            p += 1;
            if p == self.hashes.len() {
                p = 0;
            }
        }
        self.hashes[p] = id;
    }

    fn rehash_all(&mut self) {
        self.load = 0;
        let mut pos = 0;
        while pos < self.data.len() {
            let end = pos + self.data[pos..].iter().position(|&b| b == 0).unwrap();
            let hash = Self::string_hash(&self.data[pos..end]);
            if self.load * 2 >= self.hashes.len() {
                // The table is too small for the arena: grow and restart.
                self.hashes = vec![-1; self.hashes.len() * 2 + 3];
                self.rehash_all();
                return;
            }
            self.add_hash_no_rehash(hash, pos as i32);
            pos = end + 1;
        }
    }
}

struct DictionaryIter<'a> {
    dict: &'a StringDictionary,
    pos: usize,
}

impl<'a> Iterator for DictionaryIter<'a> {
    type Item = (LabelId, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.dict.data.len() {
            return None;
        }
        let id = self.pos as LabelId;
        let s = self.dict.get(id);
        self.pos += s.len() + 1;
        Some((id, s))
    }
}
