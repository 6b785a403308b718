//! Merged cursors over a hot and a snapshot cursor.
//!
//! A merged cursor walks two ordered cursors in lockstep and presents the
//! sequence a single store would hold: hot entries shadow snapshot entries
//! on key collisions, tombstones suppress snapshot entries, and iteration
//! never yields a key twice.
//!
//! Invariant: at every externally observable position the cursor sits on
//! the entry the merged logical store would expose there.

use std::cmp::Ordering;

use crate::buckets::TOMBSTONE;
use crate::error::{Error, Result};
use crate::kv::{Cursor, DupCursor, KvPair};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// Compares two optional keys under the iteration direction.
///
/// `Less` means "earlier in iteration order". An exhausted side (`None`)
/// always sorts later. Returns `None` when both sides are exhausted.
fn cmp_keys(dir: Direction, a: Option<&[u8]>, b: Option<&[u8]>) -> Option<Ordering> {
    match (a, b) {
        (None, None) => None,
        (None, Some(_)) => Some(Ordering::Greater),
        (Some(_), None) => Some(Ordering::Less),
        (Some(a), Some(b)) => Some(match dir {
            Direction::Forward => a.cmp(b),
            Direction::Backward => b.cmp(a),
        }),
    }
}

fn advance<C: Cursor + ?Sized>(cursor: &mut C, dir: Direction) -> Result<Option<KvPair>> {
    match dir {
        Direction::Forward => cursor.next(),
        Direction::Backward => cursor.prev(),
    }
}

fn key_of(entry: &Option<KvPair>) -> Option<&[u8]> {
    entry.as_ref().map(|(k, _)| k.as_slice())
}

/// Ordered merge of one hot cursor over one snapshot cursor.
///
/// `C` is `dyn Cursor` for plain buckets and `dyn DupCursor` for dup-sorted
/// buckets; the merge logic is identical.
pub struct MergedCursor<C: ?Sized> {
    hot: Box<C>,
    snap: Box<C>,
    /// Last key returned to the caller.
    current_key: Option<Vec<u8>>,
}

impl<C: Cursor + ?Sized> MergedCursor<C> {
    /// Merge `hot` over `snap`. Both cursors must be fresh and positioned in
    /// the same bucket.
    pub fn new(hot: Box<C>, snap: Box<C>) -> Self {
        Self { hot, snap, current_key: None }
    }

    fn save_current(&mut self, key: &[u8]) {
        self.current_key = Some(key.to_vec());
    }

    /// One merge step in the given direction.
    ///
    /// Probes both children's current entries (advancing a child whose
    /// position is undefined), advances the side that is earlier in
    /// iteration order, advances both on a key collision, and returns the
    /// surviving earlier entry with hot winning ties. Does not filter
    /// tombstones; callers loop.
    fn step(&mut self, dir: Direction) -> Result<Option<KvPair>> {
        let mut hot_entry = self.hot.current()?;
        let mut no_hot_advance = false;
        if hot_entry.is_none() {
            hot_entry = advance(&mut *self.hot, dir)?;
            no_hot_advance = true;
        }

        let mut snap_entry = self.snap.current()?;
        let mut no_snap_advance = false;
        if snap_entry.is_none() {
            snap_entry = advance(&mut *self.snap, dir)?;
            no_snap_advance = true;
        }

        let Some(cmp) = cmp_keys(dir, key_of(&hot_entry), key_of(&snap_entry)) else {
            return Ok(None);
        };

        match cmp {
            Ordering::Greater => {
                // Snapshot is earlier: it was returned last, move it on.
                if !no_snap_advance {
                    snap_entry = advance(&mut *self.snap, dir)?;
                    // If the snapshot just ran dry while hot is still pinned
                    // on a key at or before the last returned one, hot must
                    // advance too or we would re-yield it.
                    if snap_entry.is_none() {
                        if let (Some(cur), Some(hot_key)) =
                            (self.current_key.as_deref(), key_of(&hot_entry))
                        {
                            if cmp_keys(dir, Some(cur), Some(hot_key)) != Some(Ordering::Less) {
                                hot_entry = advance(&mut *self.hot, dir)?;
                            }
                        }
                    }
                }
            },
            Ordering::Less => {
                if !no_hot_advance {
                    hot_entry = advance(&mut *self.hot, dir)?;
                    if hot_entry.is_none() {
                        if let (Some(cur), Some(snap_key)) =
                            (self.current_key.as_deref(), key_of(&snap_entry))
                        {
                            if cmp_keys(dir, Some(cur), Some(snap_key)) != Some(Ordering::Less) {
                                snap_entry = advance(&mut *self.snap, dir)?;
                            }
                        }
                    }
                }
            },
            Ordering::Equal => {
                // Same key on both sides: hot shadowed snapshot; move both.
                if !no_hot_advance {
                    hot_entry = advance(&mut *self.hot, dir)?;
                }
                if !no_snap_advance {
                    snap_entry = advance(&mut *self.snap, dir)?;
                }
            },
        }

        let Some(cmp) = cmp_keys(dir, key_of(&hot_entry), key_of(&snap_entry)) else {
            return Ok(None);
        };
        if cmp != Ordering::Greater {
            Ok(hot_entry)
        } else {
            Ok(snap_entry)
        }
    }

    /// Advance forward, skipping tombstones, and record the returned key.
    fn next_live(&mut self) -> Result<Option<KvPair>> {
        loop {
            match self.step(Direction::Forward)? {
                None => return Ok(None),
                Some((k, v)) => {
                    if v != TOMBSTONE {
                        self.save_current(&k);
                        return Ok(Some((k, v)));
                    }
                },
            }
        }
    }

    /// Step backward, skipping tombstones and any key not strictly earlier
    /// than the last returned one.
    fn prev_live(&mut self) -> Result<Option<KvPair>> {
        loop {
            match self.step(Direction::Backward)? {
                None => return Ok(None),
                Some((k, v)) => {
                    if v == TOMBSTONE {
                        continue;
                    }
                    if let Some(cur) = self.current_key.as_deref() {
                        // Only keys strictly below the last returned one may
                        // be emitted going backward.
                        if k.as_slice() >= cur {
                            continue;
                        }
                    }
                    self.save_current(&k);
                    return Ok(Some((k, v)));
                },
            }
        }
    }

    /// Resolve an initial candidate from `first`/`last`/`seek`: return it if
    /// live, otherwise record it and continue in `dir` past it.
    fn settle(&mut self, candidate: Option<KvPair>, dir: Direction) -> Result<Option<KvPair>> {
        match candidate {
            None => Ok(None),
            Some((k, v)) => {
                if v == TOMBSTONE {
                    self.save_current(&k);
                    match dir {
                        Direction::Forward => self.next_live(),
                        Direction::Backward => self.prev_live(),
                    }
                } else {
                    self.save_current(&k);
                    Ok(Some((k, v)))
                }
            },
        }
    }
}

impl<C: Cursor + ?Sized> Cursor for MergedCursor<C> {
    fn first(&mut self) -> Result<Option<KvPair>> {
        let hot = self.hot.first()?;
        let snap = self.snap.first()?;
        let Some(cmp) = cmp_keys(Direction::Forward, key_of(&hot), key_of(&snap)) else {
            return Ok(None);
        };
        let candidate = if cmp != Ordering::Greater { hot } else { snap };
        self.settle(candidate, Direction::Forward)
    }

    fn last(&mut self) -> Result<Option<KvPair>> {
        let hot = self.hot.last()?;
        let snap = self.snap.last()?;
        let Some(cmp) = cmp_keys(Direction::Backward, key_of(&hot), key_of(&snap)) else {
            return Ok(None);
        };
        let candidate = if cmp != Ordering::Greater { hot } else { snap };
        self.settle(candidate, Direction::Backward)
    }

    fn seek(&mut self, key: &[u8]) -> Result<Option<KvPair>> {
        let hot = self.hot.seek(key)?;
        let snap = self.snap.seek(key)?;

        // Exact hit in hot wins outright; a tombstone there means the key is
        // dead and iteration continues past it.
        if let Some((hk, hv)) = &hot {
            if hk.as_slice() == key {
                if hv == TOMBSTONE {
                    self.save_current(key);
                    return self.next_live();
                }
                self.save_current(hk);
                return Ok(hot);
            }
        }
        // Exact hit in snapshot is live: hot has no entry at this key or the
        // branch above would have taken it.
        if let Some((sk, _)) = &snap {
            if sk.as_slice() == key {
                self.save_current(sk);
                return Ok(snap);
            }
        }

        let Some(cmp) = cmp_keys(Direction::Forward, key_of(&hot), key_of(&snap)) else {
            return Ok(None);
        };
        let candidate = if cmp != Ordering::Greater { hot } else { snap };
        self.settle(candidate, Direction::Forward)
    }

    fn seek_exact(&mut self, key: &[u8]) -> Result<Option<KvPair>> {
        match self.hot.seek_exact(key)? {
            Some((_, v)) if v == TOMBSTONE => Ok(None),
            Some((k, v)) => {
                self.save_current(&k);
                Ok(Some((k, v)))
            },
            None => {
                let snap = self.snap.seek_exact(key)?;
                if let Some((k, _)) = &snap {
                    self.save_current(k);
                }
                Ok(snap)
            },
        }
    }

    fn current(&mut self) -> Result<Option<KvPair>> {
        let hot = self.hot.current()?;
        if let (Some((hk, _)), Some(cur)) = (&hot, self.current_key.as_deref()) {
            if hk.as_slice() == cur {
                return Ok(hot);
            }
        }
        self.snap.current()
    }

    fn next(&mut self) -> Result<Option<KvPair>> {
        self.next_live()
    }

    fn prev(&mut self) -> Result<Option<KvPair>> {
        self.prev_live()
    }
}

impl<C: DupCursor + ?Sized> DupCursor for MergedCursor<C> {
    fn seek_both_exact(&mut self, key: &[u8], value: &[u8]) -> Result<Option<KvPair>> {
        match self.hot.seek_both_exact(key, value)? {
            Some((_, v)) if v == TOMBSTONE => Ok(None),
            Some((k, v)) => {
                self.save_current(&k);
                Ok(Some((k, v)))
            },
            None => {
                let snap = self.snap.seek_both_exact(key, value)?;
                if let Some((k, _)) = &snap {
                    self.save_current(k);
                }
                Ok(snap)
            },
        }
    }

    fn seek_both_range(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        // The hot store post-dates the snapshot, so a hot match is
        // authoritative even when the snapshot holds a closer duplicate.
        let hot = self.hot.seek_both_range(key, value)?;
        if hot.is_some() {
            self.save_current(key);
            return Ok(hot);
        }
        self.snap.seek_both_range(key, value)
    }

    fn first_dup(&mut self) -> Result<Option<Vec<u8>>> {
        Err(Error::Unsupported { op: "merged first_dup" })
    }

    fn next_dup(&mut self) -> Result<Option<KvPair>> {
        Err(Error::Unsupported { op: "merged next_dup" })
    }

    fn next_no_dup(&mut self) -> Result<Option<KvPair>> {
        Err(Error::Unsupported { op: "merged next_no_dup" })
    }

    fn last_dup(&mut self) -> Result<Option<Vec<u8>>> {
        Err(Error::Unsupported { op: "merged last_dup" })
    }

    fn count_duplicates(&mut self) -> Result<u64> {
        Err(Error::Unsupported { op: "merged count_duplicates" })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::buckets::{ACCOUNT_CHANGE_SET, PLAIN_STATE};
    use crate::kv::{KvStoreExt, Tx};
    use crate::mem::MemKv;

    fn seeded(entries: &[(&[u8], &[u8])]) -> MemKv {
        let kv = MemKv::new();
        kv.update(|tx| {
            for (k, v) in entries {
                tx.put(PLAIN_STATE, k, v)?;
            }
            Ok(())
        })
        .unwrap();
        kv
    }

    fn walk_forward(cursor: &mut dyn Cursor) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        let mut entry = cursor.first().unwrap();
        while let Some(pair) = entry {
            out.push(pair);
            entry = cursor.next().unwrap();
        }
        out
    }

    #[test]
    fn test_merge_interleaved_keys() {
        let hot = seeded(&[(b"b", b"hb"), (b"d", b"hd")]);
        let snap = seeded(&[(b"a", b"sa"), (b"b", b"sb"), (b"c", b"sc")]);
        let hot_tx = hot.begin_ro().unwrap();
        let snap_tx = snap.begin_ro().unwrap();
        let mut merged = MergedCursor::new(
            hot_tx.cursor(PLAIN_STATE).unwrap(),
            snap_tx.cursor(PLAIN_STATE).unwrap(),
        );
        assert_eq!(
            walk_forward(&mut merged),
            vec![
                (b"a".to_vec(), b"sa".to_vec()),
                (b"b".to_vec(), b"hb".to_vec()),
                (b"c".to_vec(), b"sc".to_vec()),
                (b"d".to_vec(), b"hd".to_vec()),
            ]
        );
    }

    #[test]
    fn test_merge_skips_tombstones_everywhere() {
        let hot = seeded(&[(b"a", &[0u8]), (b"c", b"hc")]);
        let snap = seeded(&[(b"a", b"sa"), (b"b", b"sb")]);
        let hot_tx = hot.begin_ro().unwrap();
        let snap_tx = snap.begin_ro().unwrap();
        let mut merged = MergedCursor::new(
            hot_tx.cursor(PLAIN_STATE).unwrap(),
            snap_tx.cursor(PLAIN_STATE).unwrap(),
        );
        // First lands past the tombstoned key.
        assert_eq!(merged.first().unwrap(), Some((b"b".to_vec(), b"sb".to_vec())));
        assert_eq!(merged.next().unwrap(), Some((b"c".to_vec(), b"hc".to_vec())));
        assert_eq!(merged.next().unwrap(), None);
    }

    #[test]
    fn test_merge_last_and_prev() {
        let hot = seeded(&[(b"c", &[0u8]), (b"d", b"hd")]);
        let snap = seeded(&[(b"a", b"sa"), (b"c", b"sc")]);
        let hot_tx = hot.begin_ro().unwrap();
        let snap_tx = snap.begin_ro().unwrap();
        let mut merged = MergedCursor::new(
            hot_tx.cursor(PLAIN_STATE).unwrap(),
            snap_tx.cursor(PLAIN_STATE).unwrap(),
        );
        assert_eq!(merged.last().unwrap(), Some((b"d".to_vec(), b"hd".to_vec())));
        // c is tombstoned; prev steps over it.
        assert_eq!(merged.prev().unwrap(), Some((b"a".to_vec(), b"sa".to_vec())));
        assert_eq!(merged.prev().unwrap(), None);
    }

    #[test]
    fn test_merge_last_tombstone_tail() {
        let hot = seeded(&[(b"d", &[0u8])]);
        let snap = seeded(&[(b"a", b"sa"), (b"d", b"sd")]);
        let hot_tx = hot.begin_ro().unwrap();
        let snap_tx = snap.begin_ro().unwrap();
        let mut merged = MergedCursor::new(
            hot_tx.cursor(PLAIN_STATE).unwrap(),
            snap_tx.cursor(PLAIN_STATE).unwrap(),
        );
        assert_eq!(merged.last().unwrap(), Some((b"a".to_vec(), b"sa".to_vec())));
    }

    #[test]
    fn test_merge_seek_between_keys() {
        let hot = seeded(&[(b"d", b"hd")]);
        let snap = seeded(&[(b"a", b"sa"), (b"e", b"se")]);
        let hot_tx = hot.begin_ro().unwrap();
        let snap_tx = snap.begin_ro().unwrap();
        let mut merged = MergedCursor::new(
            hot_tx.cursor(PLAIN_STATE).unwrap(),
            snap_tx.cursor(PLAIN_STATE).unwrap(),
        );
        assert_eq!(merged.seek(b"b").unwrap(), Some((b"d".to_vec(), b"hd".to_vec())));
        assert_eq!(merged.next().unwrap(), Some((b"e".to_vec(), b"se".to_vec())));
    }

    fn dup_seeded(entries: &[(&[u8], &[u8])]) -> MemKv {
        let kv = MemKv::new();
        kv.update(|tx| {
            for (k, v) in entries {
                tx.put(ACCOUNT_CHANGE_SET, k, v)?;
            }
            Ok(())
        })
        .unwrap();
        kv
    }

    #[test]
    fn test_merged_dup_seek_both() {
        let hot = dup_seeded(&[(b"\x01", b"hot-a")]);
        let snap = dup_seeded(&[(b"\x01", b"snap-a"), (b"\x02", b"snap-b")]);
        let hot_tx = hot.begin_ro().unwrap();
        let snap_tx = snap.begin_ro().unwrap();
        let mut merged = MergedCursor::new(
            hot_tx.cursor_dup(ACCOUNT_CHANGE_SET).unwrap(),
            snap_tx.cursor_dup(ACCOUNT_CHANGE_SET).unwrap(),
        );

        // Hot hit wins; snapshot satisfies what hot lacks.
        assert_eq!(
            merged.seek_both_exact(b"\x01", b"hot-a").unwrap(),
            Some((b"\x01".to_vec(), b"hot-a".to_vec()))
        );
        assert_eq!(
            merged.seek_both_exact(b"\x02", b"snap-b").unwrap(),
            Some((b"\x02".to_vec(), b"snap-b".to_vec()))
        );
        // Range: hot answers even when the snapshot holds a closer match.
        assert_eq!(merged.seek_both_range(b"\x01", b"a").unwrap(), Some(b"hot-a".to_vec()));
        assert_eq!(merged.seek_both_range(b"\x02", b"a").unwrap(), Some(b"snap-b".to_vec()));
    }

    #[test]
    fn test_merged_dup_primitives_unsupported() {
        let hot = dup_seeded(&[]);
        let snap = dup_seeded(&[]);
        let hot_tx = hot.begin_ro().unwrap();
        let snap_tx = snap.begin_ro().unwrap();
        let mut merged = MergedCursor::new(
            hot_tx.cursor_dup(ACCOUNT_CHANGE_SET).unwrap(),
            snap_tx.cursor_dup(ACCOUNT_CHANGE_SET).unwrap(),
        );
        assert!(matches!(merged.first_dup().unwrap_err(), Error::Unsupported { .. }));
        assert!(matches!(merged.next_dup().unwrap_err(), Error::Unsupported { .. }));
        assert!(matches!(merged.next_no_dup().unwrap_err(), Error::Unsupported { .. }));
        assert!(matches!(merged.last_dup().unwrap_err(), Error::Unsupported { .. }));
        assert!(matches!(merged.count_duplicates().unwrap_err(), Error::Unsupported { .. }));
    }
}
