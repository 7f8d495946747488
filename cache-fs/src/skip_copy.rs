//! The `skip_copy` cursor (§4.6): copies the bytes of one fragment that lie
//! within `[skip_beg, all_len - skip_end)` while skipping the bytes before
//! and after that window, resumable across multiple source chunks.
//!
//! Ported near-directly from
//! `examples/original_source/xproxy-beta/cache/skip_copy.h`'s three-phase
//! skip-before / copy-middle / skip-after state machine.

/// Bytes skipped and copied during one [`SkipCopy::step`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Bytes {
    pub skipped: u64,
    pub copied: u64,
}

/// Resumable skip/copy cursor over one fragment's logical byte range.
///
/// `all_len` is the full length of the fragment being read or written.
/// `[data_beg, all_len - data_end)` is the window of bytes the caller
/// actually wants; everything before `data_beg` and everything in the last
/// `data_end` bytes is skipped rather than copied.
pub struct SkipCopy {
    curr_offs: u64,
    all_len: u64,
    data_beg: u64,
    data_end: u64,
}

impl SkipCopy {
    /// `cur_off` is the starting offset within the fragment (normally 0).
    /// Panics if `cur_off > all_len` or `data_beg + data_end > all_len`,
    /// mirroring the original's constructor asserts.
    pub fn new(cur_off: u64, all_len: u64, data_beg: u64, data_end: u64) -> Self {
        assert!(cur_off <= all_len);
        assert!(data_beg + data_end <= all_len);
        Self {
            curr_offs: cur_off,
            all_len,
            data_beg,
            data_end,
        }
    }

    pub fn done(&self) -> bool {
        self.curr_offs == self.all_len
    }

    pub fn current_offset(&self) -> u64 {
        self.curr_offs
    }

    /// Advances the cursor by consuming from `from` (a byte-producing
    /// source) into `to` (the destination buffer), returning how much was
    /// skipped and how much was copied in this call. `from_skip` and
    /// `from_read` abstract over "advance the source without copying" and
    /// "advance the source while copying into `to`", matching the
    /// original's `Rdr::skip_read`/`Rdr::read` split so the same cursor can
    /// drive either a network source (which must still consume skipped
    /// bytes) or a disk source (which can seek past them).
    pub fn step<S, R>(&mut self, to: &mut [u8], mut from_skip: S, mut from_read: R) -> Bytes
    where
        S: FnMut(u64) -> u64,
        R: FnMut(&mut [u8]) -> u64,
    {
        let data_window_end = self.all_len - self.data_end;
        let mut out = Bytes::default();
        let mut to_off = 0usize;

        // Phase 1: skip the prefix before `data_beg`.
        if self.curr_offs < self.data_beg {
            let to_skip = self.data_beg - self.curr_offs;
            let skipped = from_skip(to_skip);
            self.curr_offs += skipped;
            out.skipped += skipped;
            if skipped < to_skip {
                return out;
            }
        }

        // Phase 2: copy the requested window.
        if self.curr_offs >= self.data_beg && self.curr_offs < data_window_end {
            let remaining_window = data_window_end - self.curr_offs;
            let space = (to.len() - to_off) as u64;
            let want = remaining_window.min(space);
            if want > 0 {
                let copied = from_read(&mut to[to_off..to_off + want as usize]);
                self.curr_offs += copied;
                out.copied += copied;
                to_off += copied as usize;
                if copied < want {
                    return out;
                }
            }
        }

        // Phase 3: skip the suffix after the window.
        if self.curr_offs >= data_window_end && self.curr_offs < self.all_len {
            let to_skip = self.all_len - self.curr_offs;
            let skipped = from_skip(to_skip);
            self.curr_offs += skipped;
            out.skipped += skipped;
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drives a `SkipCopy` to completion over a source made of fixed-size
    /// chunks, returning total skipped/copied and the bytes actually
    /// copied into `dest`.
    fn drive(all_len: u64, beg: u64, end: u64, chunk: usize) -> (u64, u64, Vec<u8>) {
        let source: Vec<u8> = (0..all_len).map(|i| (i % 251) as u8).collect();
        let mut src_pos = 0usize;
        let mut cursor = SkipCopy::new(0, all_len, beg, end);
        let mut dest = Vec::new();
        let mut total_skipped = 0u64;
        let mut total_copied = 0u64;

        while !cursor.done() {
            let mut buf = vec![0u8; chunk];
            let src_pos_ref = &mut src_pos;
            let source_ref = &source;
            let step = cursor.step(
                &mut buf,
                |n| {
                    let avail = (source_ref.len() - *src_pos_ref) as u64;
                    let n = n.min(avail);
                    *src_pos_ref += n as usize;
                    n
                },
                |dst| {
                    let avail = source_ref.len() - *src_pos_ref;
                    let n = dst.len().min(avail);
                    dst[..n].copy_from_slice(&source_ref[*src_pos_ref..*src_pos_ref + n]);
                    *src_pos_ref += n;
                    n as u64
                },
            );
            total_skipped += step.skipped;
            total_copied += step.copied;
            dest.extend_from_slice(&buf[..step.copied as usize]);
            if step.skipped == 0 && step.copied == 0 {
                break;
            }
        }

        (total_skipped, total_copied, dest)
    }

    #[test]
    fn copies_exact_window_no_skip() {
        let (skipped, copied, dest) = drive(100, 0, 0, 16);
        assert_eq!(skipped, 0);
        assert_eq!(copied, 100);
        assert_eq!(dest.len(), 100);
    }

    #[test]
    fn skips_prefix_and_suffix() {
        let (skipped, copied, dest) = drive(100, 10, 20, 16);
        assert_eq!(skipped, 30);
        assert_eq!(copied, 70);
        assert_eq!(dest.len(), 70);
        let expected: Vec<u8> = (10..90).map(|i: u64| (i % 251) as u8).collect();
        assert_eq!(dest, expected);
    }

    #[test]
    fn done_becomes_true_at_all_len() {
        let mut cursor = SkipCopy::new(0, 10, 2, 2);
        assert!(!cursor.done());
        let mut buf = vec![0u8; 10];
        cursor.step(&mut buf, |n| n, |dst| {
            dst.fill(0xAA);
            dst.len() as u64
        });
        assert!(cursor.done());
    }
}
