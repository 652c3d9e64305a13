//! In-memory data families.
//!
//! Each family is an independent namespace: the same key may hold a string, a hash and a list
//! at once, and key counts are reported per family.

use std::collections::{HashMap, HashSet, VecDeque};

use pika_common::error::{PikaError, PikaResult};

/// Key counts reported by a keyspace scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyCounts {
    /// String keys.
    pub kv: u64,
    /// Hash keys.
    pub hash: u64,
    /// List keys.
    pub list: u64,
    /// Sorted-set keys.
    pub zset: u64,
    /// Set keys.
    pub set: u64,
}

/// All five data families of one store.
#[derive(Debug, Clone, Default)]
pub struct Keyspace {
    strings: HashMap<Vec<u8>, Vec<u8>>,
    hashes: HashMap<Vec<u8>, HashMap<Vec<u8>, Vec<u8>>>,
    lists: HashMap<Vec<u8>, VecDeque<Vec<u8>>>,
    sets: HashMap<Vec<u8>, HashSet<Vec<u8>>>,
    zsets: HashMap<Vec<u8>, HashMap<Vec<u8>, f64>>,
}

impl Keyspace {
    /// Counts keys per family.
    #[must_use]
    pub fn key_counts(&self) -> KeyCounts {
        KeyCounts {
            kv: self.strings.len() as u64,
            hash: self.hashes.len() as u64,
            list: self.lists.len() as u64,
            zset: self.zsets.len() as u64,
            set: self.sets.len() as u64,
        }
    }

    pub(crate) fn strings(&self) -> impl Iterator<Item = (&Vec<u8>, &Vec<u8>)> {
        self.strings.iter()
    }

    pub(crate) fn hashes(&self) -> impl Iterator<Item = (&Vec<u8>, &HashMap<Vec<u8>, Vec<u8>>)> {
        self.hashes.iter()
    }

    pub(crate) fn lists(&self) -> impl Iterator<Item = (&Vec<u8>, &VecDeque<Vec<u8>>)> {
        self.lists.iter()
    }

    pub(crate) fn sets(&self) -> impl Iterator<Item = (&Vec<u8>, &HashSet<Vec<u8>>)> {
        self.sets.iter()
    }

    pub(crate) fn zsets(&self) -> impl Iterator<Item = (&Vec<u8>, &HashMap<Vec<u8>, f64>)> {
        self.zsets.iter()
    }

    /// Stores one string value.
    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        let _ = self.strings.insert(key, value);
    }

    /// Reads one string value.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<&Vec<u8>> {
        self.strings.get(key)
    }

    /// Removes `key` from every family. Returns `true` when any family held it.
    pub fn del(&mut self, key: &[u8]) -> bool {
        let mut removed = self.strings.remove(key).is_some();
        removed |= self.hashes.remove(key).is_some();
        removed |= self.lists.remove(key).is_some();
        removed |= self.sets.remove(key).is_some();
        removed |= self.zsets.remove(key).is_some();
        removed
    }

    /// Returns `true` when any family holds `key`.
    #[must_use]
    pub fn exists(&self, key: &[u8]) -> bool {
        self.strings.contains_key(key)
            || self.hashes.contains_key(key)
            || self.lists.contains_key(key)
            || self.sets.contains_key(key)
            || self.zsets.contains_key(key)
    }

    /// Adds `delta` to the integer stored at `key`, treating a missing key as zero.
    ///
    /// # Errors
    ///
    /// Returns `PikaError::Storage` when the value is not an integer or the result overflows.
    pub fn incr_by(&mut self, key: &[u8], delta: i64) -> PikaResult<i64> {
        let current = match self.strings.get(key) {
            Some(raw) => std::str::from_utf8(raw)
                .ok()
                .and_then(|text| text.parse::<i64>().ok())
                .ok_or_else(|| {
                    PikaError::Storage("value is not an integer or out of range".to_owned())
                })?,
            None => 0,
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| PikaError::Storage("increment or decrement would overflow".to_owned()))?;
        let _ = self
            .strings
            .insert(key.to_vec(), next.to_string().into_bytes());
        Ok(next)
    }

    /// Sets one hash field. Returns `true` when the field is new.
    pub fn hset(&mut self, key: Vec<u8>, field: Vec<u8>, value: Vec<u8>) -> bool {
        self.hashes
            .entry(key)
            .or_default()
            .insert(field, value)
            .is_none()
    }

    /// Reads one hash field.
    #[must_use]
    pub fn hget(&self, key: &[u8], field: &[u8]) -> Option<&Vec<u8>> {
        self.hashes.get(key).and_then(|fields| fields.get(field))
    }

    /// Removes hash fields, dropping the key once empty. Returns the number removed.
    pub fn hdel(&mut self, key: &[u8], fields: &[Vec<u8>]) -> usize {
        let Some(entry) = self.hashes.get_mut(key) else {
            return 0;
        };
        let removed = fields
            .iter()
            .filter(|field| entry.remove(field.as_slice()).is_some())
            .count();
        if entry.is_empty() {
            let _ = self.hashes.remove(key);
        }
        removed
    }

    /// Number of fields in one hash.
    #[must_use]
    pub fn hlen(&self, key: &[u8]) -> usize {
        self.hashes.get(key).map_or(0, HashMap::len)
    }

    /// Pushes values to the head, leftmost argument first. Returns the new length.
    pub fn lpush(&mut self, key: Vec<u8>, values: Vec<Vec<u8>>) -> usize {
        let list = self.lists.entry(key).or_default();
        for value in values {
            list.push_front(value);
        }
        list.len()
    }

    /// Pushes values to the tail. Returns the new length.
    pub fn rpush(&mut self, key: Vec<u8>, values: Vec<Vec<u8>>) -> usize {
        let list = self.lists.entry(key).or_default();
        list.extend(values);
        list.len()
    }

    /// Pops the head element, dropping the key once empty.
    pub fn lpop(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let list = self.lists.get_mut(key)?;
        let value = list.pop_front();
        if list.is_empty() {
            let _ = self.lists.remove(key);
        }
        value
    }

    /// Length of one list.
    #[must_use]
    pub fn llen(&self, key: &[u8]) -> usize {
        self.lists.get(key).map_or(0, VecDeque::len)
    }

    /// Every element of one list, head first.
    #[must_use]
    pub fn lrange_all(&self, key: &[u8]) -> Vec<Vec<u8>> {
        self.lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Adds set members. Returns the number of new members.
    pub fn sadd(&mut self, key: Vec<u8>, members: Vec<Vec<u8>>) -> usize {
        let set = self.sets.entry(key).or_default();
        members
            .into_iter()
            .filter(|member| set.insert(member.clone()))
            .count()
    }

    /// Removes set members, dropping the key once empty. Returns the number removed.
    pub fn srem(&mut self, key: &[u8], members: &[Vec<u8>]) -> usize {
        let Some(set) = self.sets.get_mut(key) else {
            return 0;
        };
        let removed = members
            .iter()
            .filter(|member| set.remove(member.as_slice()))
            .count();
        if set.is_empty() {
            let _ = self.sets.remove(key);
        }
        removed
    }

    /// Number of members in one set.
    #[must_use]
    pub fn scard(&self, key: &[u8]) -> usize {
        self.sets.get(key).map_or(0, HashSet::len)
    }

    /// Adds or rescores sorted-set members. Returns the number of new members.
    pub fn zadd(&mut self, key: Vec<u8>, entries: Vec<(f64, Vec<u8>)>) -> usize {
        let zset = self.zsets.entry(key).or_default();
        entries
            .into_iter()
            .filter(|(score, member)| zset.insert(member.clone(), *score).is_none())
            .count()
    }

    /// Number of members in one sorted set.
    #[must_use]
    pub fn zcard(&self, key: &[u8]) -> usize {
        self.zsets.get(key).map_or(0, HashMap::len)
    }

    /// Score of one sorted-set member.
    #[must_use]
    pub fn zscore(&self, key: &[u8], member: &[u8]) -> Option<f64> {
        self.zsets.get(key).and_then(|zset| zset.get(member)).copied()
    }
}
