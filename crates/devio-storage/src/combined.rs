use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::ops::Bound;

use crate::util::{checked_end, resolve_seek};
use crate::{Result, Stream, StreamError};

/// Factory for new trailing members of an extendable [`CombinedSeekStream`].
pub type MemberFactory<S> = Box<dyn FnMut() -> Result<S> + Send>;

struct Member<S> {
    start: u64,
    stream: S,
}

/// Concatenation of member streams into one contiguous address space.
///
/// Members are keyed by their cumulative end offset; the member serving offset `x` is the first
/// one whose key is greater than `x`. Zero-length members are skipped since they can never be
/// the target of a seek.
///
/// An extendable stream accepts writes positioned exactly at its end by appending a fresh member
/// obtained from its [`MemberFactory`]. Appended members are never removed.
pub struct CombinedSeekStream<S> {
    members: BTreeMap<u64, Member<S>>,
    length: u64,
    position: u64,
    /// Key of the member holding `position`, `None` when positioned at or past the end.
    current: Option<u64>,
    factory: Option<MemberFactory<S>>,
}

impl<S: Stream> CombinedSeekStream<S> {
    pub fn new(members: impl IntoIterator<Item = S>) -> Result<Self> {
        let mut combined = Self {
            members: BTreeMap::new(),
            length: 0,
            position: 0,
            current: None,
            factory: None,
        };
        for member in members {
            combined.push(member)?;
        }
        combined.resolve(0)?;
        Ok(combined)
    }

    /// Like [`CombinedSeekStream::new`], but writes at the end append members built by `factory`.
    pub fn extendable(
        members: impl IntoIterator<Item = S>,
        factory: impl FnMut() -> Result<S> + Send + 'static,
    ) -> Result<Self> {
        let mut combined = Self::new(members)?;
        combined.factory = Some(Box::new(factory));
        Ok(combined)
    }

    pub fn is_extendable(&self) -> bool {
        self.factory.is_some()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Cumulative end offsets of all members, in logical order.
    pub fn member_ends(&self) -> impl Iterator<Item = u64> + '_ {
        self.members.keys().copied()
    }

    /// Key and local offset of the member serving the current position.
    pub fn current_member(&self) -> Option<(u64, u64)> {
        let key = self.current?;
        let member = &self.members[&key];
        Some((key, self.position - member.start))
    }

    /// Position of the current member's own stream, or the composite position when past the end.
    pub fn physical_position(&self) -> u64 {
        match self.current {
            Some(key) => self.members[&key].stream.position(),
            None => self.position,
        }
    }

    pub fn into_members(self) -> Vec<S> {
        self.members.into_values().map(|m| m.stream).collect()
    }

    /// Append `stream` as the new last member.
    pub fn push(&mut self, stream: S) -> Result<()> {
        let len = stream.len()?;
        self.insert(stream, len)
    }

    /// Register `stream` as the last member, exposing only its first `len` bytes.
    fn insert(&mut self, stream: S, len: u64) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let end = self
            .length
            .checked_add(len)
            .ok_or(StreamError::OffsetOverflow)?;
        self.members.insert(
            end,
            Member {
                start: self.length,
                stream,
            },
        );
        self.length = end;
        Ok(())
    }

    /// Point `current` at the member serving `target` and seek it to the matching local offset.
    fn resolve(&mut self, target: u64) -> Result<()> {
        self.position = target;
        let found = self
            .members
            .range_mut((Bound::Excluded(target), Bound::Unbounded))
            .next();
        match found {
            Some((&key, member)) => {
                let member_len = key - member.start;
                let local = member_len - (key - target);
                member.stream.seek(SeekFrom::Start(local))?;
                self.current = Some(key);
            }
            None => self.current = None,
        }
        debug_assert_eq!(
            self.current.map(|_| self.physical_position()),
            self.current_member().map(|(_, local)| local),
            "resolved member position out of sync"
        );
        Ok(())
    }

    fn append_member(&mut self, buf: &[u8]) -> Result<usize> {
        let Some(factory) = self.factory.as_mut() else {
            return Err(StreamError::WriteBeyondEnd {
                position: self.position,
                len: buf.len() as u64,
                length: self.length,
            });
        };
        let mut stream = factory()?;
        if stream.len()? != 0 {
            return Err(StreamError::InvalidConfig(
                "member factory must produce empty streams",
            ));
        }
        stream.write_all(buf)?;
        // The member may have grown past the appended bytes; only those become visible.
        let start = self.length;
        self.insert(stream, buf.len() as u64)?;
        self.resolve(start + buf.len() as u64)?;
        Ok(buf.len())
    }
}

impl<S: Stream> Stream for CombinedSeekStream<S> {
    fn len(&self) -> Result<u64> {
        Ok(self.length)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let target = resolve_seek(pos, self.position, self.length)?;
        self.resolve(target)?;
        Ok(target)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let Some(key) = self.current else {
                break;
            };
            let member = self
                .members
                .get_mut(&key)
                .ok_or(StreamError::InvalidConfig("current member missing"))?;
            let member_left = key - self.position;
            let chunk = ((buf.len() - done) as u64).min(member_left) as usize;
            let n = member.stream.read(&mut buf[done..done + chunk])?;
            if n == 0 {
                break;
            }
            done += n;
            if n as u64 == member_left {
                self.resolve(key)?;
            } else {
                self.position += n as u64;
            }
        }
        Ok(done)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let end = checked_end(self.position, buf.len())?;
        if self.position > self.length || (end > self.length && self.factory.is_none()) {
            return Err(StreamError::WriteBeyondEnd {
                position: self.position,
                len: buf.len() as u64,
                length: self.length,
            });
        }

        let mut done = 0;
        while done < buf.len() {
            let Some(key) = self.current else {
                // Exactly at the end of an extendable stream.
                done += self.append_member(&buf[done..])?;
                break;
            };
            let member = self
                .members
                .get_mut(&key)
                .ok_or(StreamError::InvalidConfig("current member missing"))?;
            let member_left = key - self.position;
            let chunk = ((buf.len() - done) as u64).min(member_left) as usize;
            let n = member.stream.write(&buf[done..done + chunk])?;
            if n == 0 {
                break;
            }
            done += n;
            if n as u64 == member_left {
                self.resolve(key)?;
            } else {
                self.position += n as u64;
            }
        }
        Ok(done)
    }

    fn flush(&mut self) -> Result<()> {
        for member in self.members.values_mut() {
            member.stream.flush()?;
        }
        Ok(())
    }

    fn can_write(&self) -> bool {
        self.members.values().all(|m| m.stream.can_write())
    }

    fn alignment(&self) -> u32 {
        self.members
            .values()
            .map(|m| m.stream.alignment())
            .max()
            .unwrap_or(1)
    }
}
