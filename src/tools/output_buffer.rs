use std::collections::VecDeque;

/// Bounded FIFO of output lines addressed by global sequence numbers.
///
/// Every line ever pushed gets the next sequence number; eviction from the
/// front only raises the floor (`first_seq`). Read cursors are sequence
/// numbers too, so eviction never shifts what a cursor points at.
#[derive(Debug)]
pub struct OutputBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    first_seq: u64,
}

/// Lines taken from the buffer by [`OutputBuffer::read_from`].
#[derive(Debug, PartialEq, Eq)]
pub struct LineChunk {
    pub lines: Vec<String>,
    /// Cursor position after this chunk.
    pub next_seq: u64,
    /// Lines between the requested cursor and the buffer floor that were evicted unread.
    pub dropped: u64,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            first_seq: 0,
        }
    }

    pub fn push(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
            self.first_seq += 1;
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[cfg(test)]
    pub fn first_seq(&self) -> u64 {
        self.first_seq
    }

    /// Sequence number the next pushed line will get.
    pub fn end_seq(&self) -> u64 {
        self.first_seq + self.lines.len() as u64
    }

    /// Number of retained lines at or after `cursor`.
    pub fn pending_since(&self, cursor: u64) -> usize {
        (self.end_seq() - cursor.max(self.first_seq).min(self.end_seq())) as usize
    }

    /// Up to `max` lines starting at `cursor`, clamped to the buffer floor.
    pub fn read_from(&self, cursor: u64, max: usize) -> LineChunk {
        let start = cursor.max(self.first_seq).min(self.end_seq());
        let dropped = start - cursor.min(start);
        let offset = (start - self.first_seq) as usize;
        let lines: Vec<String> = self.lines.iter().skip(offset).take(max).cloned().collect();
        LineChunk {
            next_seq: start + lines.len() as u64,
            lines,
            dropped,
        }
    }

    /// The last `n` retained lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }
}

/// Splits raw output chunks into lines.
///
/// A chunk's trailing fragment is emitted as its own line instead of waiting
/// for a newline, so prompts show up immediately and no line outgrows the
/// chunk it arrived in. `\r\n` is treated as one terminator even when a chunk
/// boundary falls between the two bytes.
#[derive(Debug, Default)]
pub struct LineSplitter {
    after_cr: bool,
}

impl LineSplitter {
    pub fn split(&mut self, chunk: &[u8]) -> Vec<String> {
        let chunk = match chunk.split_first() {
            Some((&b'\n', rest)) if self.after_cr => rest,
            _ => chunk,
        };
        self.after_cr = chunk.last() == Some(&b'\r');

        let mut segments: Vec<&[u8]> = chunk.split(|byte| *byte == b'\n').collect();
        if segments.last().map_or(false, |last| last.is_empty()) {
            segments.pop();
        }
        segments
            .into_iter()
            .map(|segment| {
                let segment = segment.strip_suffix(b"\r").unwrap_or(segment);
                String::from_utf8_lossy(segment).into_owned()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(capacity: usize, count: usize) -> OutputBuffer {
        let mut buffer = OutputBuffer::new(capacity);
        for i in 0..count {
            buffer.push(format!("line{}", i));
        }
        buffer
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut buffer = OutputBuffer::new(1000);
        for i in 0..2500 {
            buffer.push(i.to_string());
            assert!(buffer.len() <= 1000);
        }
        assert_eq!(buffer.len(), 1000);
        assert_eq!(buffer.first_seq(), 1500);
        assert_eq!(buffer.end_seq(), 2500);
        assert_eq!(buffer.tail(1), vec!["2499".to_string()]);
    }

    #[test]
    fn read_from_advances_without_gaps() {
        let buffer = filled(100, 25);
        let first = buffer.read_from(0, 10);
        assert_eq!(first.lines.len(), 10);
        assert_eq!(first.next_seq, 10);
        assert_eq!(first.dropped, 0);

        let second = buffer.read_from(first.next_seq, 10);
        assert_eq!(second.lines[0], "line10");
        assert_eq!(second.next_seq, 20);

        let rest = buffer.read_from(second.next_seq, 10);
        assert_eq!(rest.lines, vec!["line20", "line21", "line22", "line23", "line24"]);
        assert_eq!(rest.next_seq, 25);
        assert_eq!(buffer.pending_since(rest.next_seq), 0);
    }

    #[test]
    fn cursor_behind_floor_is_clamped_and_reports_loss() {
        let buffer = filled(5, 12);
        assert_eq!(buffer.first_seq(), 7);
        assert_eq!(buffer.pending_since(2), 5);

        let chunk = buffer.read_from(2, 3);
        assert_eq!(chunk.dropped, 5);
        assert_eq!(chunk.lines, vec!["line7", "line8", "line9"]);
        assert_eq!(chunk.next_seq, 10);
    }

    #[test]
    fn tail_returns_at_most_n_lines() {
        assert!(OutputBuffer::new(10).tail(5).is_empty());
        assert_eq!(filled(10, 3).tail(5).len(), 3);
        assert_eq!(filled(10, 8).tail(5), vec!["line3", "line4", "line5", "line6", "line7"]);
    }

    #[test]
    fn cursor_ahead_of_end_has_nothing_pending() {
        let buffer = filled(10, 4);
        assert_eq!(buffer.pending_since(9), 0);
        let chunk = buffer.read_from(9, 5);
        assert!(chunk.lines.is_empty());
        assert_eq!(chunk.next_seq, 4);
    }

    #[test]
    fn splitter_emits_unterminated_fragments() {
        let mut splitter = LineSplitter::default();
        assert_eq!(splitter.split(b"prompt> "), vec!["prompt> "]);
        assert_eq!(splitter.split(b"one\ntwo\n"), vec!["one", "two"]);
        assert_eq!(splitter.split(b"\n"), vec![""]);
        assert!(splitter.split(b"").is_empty());
    }

    #[test]
    fn splitter_treats_crlf_across_chunks_as_one_terminator() {
        let mut splitter = LineSplitter::default();
        assert_eq!(splitter.split(b"a\r\nb\r"), vec!["a", "b"]);
        assert_eq!(splitter.split(b"\nc\r\n"), vec!["c"]);
        assert_eq!(splitter.split(b"\n"), vec![""]);
    }

    #[test]
    fn newline_free_stream_stays_bounded() {
        let mut splitter = LineSplitter::default();
        let mut buffer = OutputBuffer::new(3);
        let chunk = vec![b'y'; 4096];
        for _ in 0..10 {
            for line in splitter.split(&chunk) {
                buffer.push(line);
            }
        }
        assert_eq!(buffer.len(), 3);
        assert!(buffer.tail(3).iter().all(|line| line.len() == 4096));
        assert_eq!(buffer.end_seq(), 10);
    }
}
