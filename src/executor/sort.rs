//! External merge sort
//!
//! Rows are buffered until their estimated size passes the spill
//! threshold; each full buffer is sorted and written to an anonymous temp
//! file as one run. Finishing merges the runs with the in-memory tail.
//! With a limit the sorter keeps only the best `limit` rows and never
//! spills.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::debug;

use super::planner::SortKey;
use crate::error::Result;
use crate::storage::tuple::Tuple;

/// Order two tuples by `keys`; NULLs sort last ascending, first descending.
pub fn compare_tuples(keys: &[SortKey], a: &Tuple, b: &Tuple) -> Ordering {
    for key in keys {
        let ord = match (a.get(key.column), b.get(key.column)) {
            (Some(x), Some(y)) => x.sort_cmp(y),
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
        };
        let ord = if key.ascending { ord } else { ord.reverse() };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// One spilled run being read back
struct Run {
    reader: BufReader<File>,
    remaining: u64,
    head: Option<Tuple>,
}

impl Run {
    fn advance(&mut self) -> Result<()> {
        self.head = if self.remaining == 0 {
            None
        } else {
            self.remaining -= 1;
            let len = self.reader.read_u32::<LittleEndian>()? as usize;
            let mut buf = vec![0u8; len];
            self.reader.read_exact(&mut buf)?;
            Some(Tuple::from_bytes(&buf)?)
        };
        Ok(())
    }
}

/// External Sorter
pub struct ExternalSorter {
    keys: Vec<SortKey>,
    limit: Option<usize>,
    spill_bytes: usize,
    buffer: Vec<Tuple>,
    buffered_bytes: usize,
    /// Spilled runs: file and row count
    runs: Vec<(File, u64)>,
}

impl ExternalSorter {
    pub fn new(keys: Vec<SortKey>, limit: Option<u64>, spill_bytes: usize) -> Self {
        Self {
            keys,
            limit: limit.map(|n| usize::try_from(n).unwrap_or(usize::MAX)),
            spill_bytes: spill_bytes.max(1),
            buffer: Vec::new(),
            buffered_bytes: 0,
            runs: Vec::new(),
        }
    }

    /// Number of runs written to disk so far
    pub fn spilled_runs(&self) -> usize {
        self.runs.len()
    }

    pub fn push(&mut self, tuple: Tuple) -> Result<()> {
        if let Some(limit) = self.limit {
            self.push_bounded(tuple, limit);
            return Ok(());
        }
        self.buffered_bytes += tuple.heap_size();
        self.buffer.push(tuple);
        if self.buffered_bytes > self.spill_bytes {
            self.spill()?;
        }
        Ok(())
    }

    /// Keep the best `limit` rows, sorted, earlier rows first among equals.
    fn push_bounded(&mut self, tuple: Tuple, limit: usize) {
        if limit == 0 {
            return;
        }
        if self.buffer.len() == limit {
            let worst = &self.buffer[limit - 1];
            if compare_tuples(&self.keys, &tuple, worst) != Ordering::Less {
                return;
            }
            self.buffer.pop();
        }
        let keys = &self.keys;
        let at = self
            .buffer
            .partition_point(|t| compare_tuples(keys, t, &tuple) != Ordering::Greater);
        self.buffer.insert(at, tuple);
    }

    fn spill(&mut self) -> Result<()> {
        let keys = &self.keys;
        self.buffer.sort_by(|a, b| compare_tuples(keys, a, b));
        let mut file = tempfile::tempfile()?;
        {
            let mut writer = BufWriter::new(&mut file);
            for tuple in &self.buffer {
                let bytes = tuple.to_bytes();
                writer.write_u32::<LittleEndian>(bytes.len() as u32)?;
                writer.write_all(&bytes)?;
            }
            writer.flush()?;
        }
        let rows = self.buffer.len() as u64;
        debug!(rows, bytes = self.buffered_bytes, run = self.runs.len(), "spilled sort run");
        self.runs.push((file, rows));
        self.buffer.clear();
        self.buffered_bytes = 0;
        Ok(())
    }

    /// Finish input and return the rows in order.
    pub fn finish(mut self) -> Result<SortedRows> {
        let keys = self.keys.clone();
        if self.runs.is_empty() {
            self.buffer.sort_by(|a, b| compare_tuples(&keys, a, b));
            return Ok(SortedRows {
                keys,
                memory: self.buffer.into_iter(),
                runs: Vec::new(),
            });
        }
        if !self.buffer.is_empty() {
            self.spill()?;
        }
        let mut runs = Vec::with_capacity(self.runs.len());
        for (mut file, rows) in self.runs {
            file.seek(SeekFrom::Start(0))?;
            let mut run = Run {
                reader: BufReader::new(file),
                remaining: rows,
                head: None,
            };
            run.advance()?;
            runs.push(run);
        }
        Ok(SortedRows {
            keys,
            memory: Vec::new().into_iter(),
            runs,
        })
    }
}

/// Sorted output of an [`ExternalSorter`]
pub struct SortedRows {
    keys: Vec<SortKey>,
    memory: std::vec::IntoIter<Tuple>,
    runs: Vec<Run>,
}

impl SortedRows {
    fn next_merged(&mut self) -> Result<Option<Tuple>> {
        let mut best: Option<usize> = None;
        for (i, run) in self.runs.iter().enumerate() {
            let Some(head) = &run.head else { continue };
            let better = match best {
                None => true,
                Some(b) => {
                    let current = self.runs[b].head.as_ref();
                    current.map_or(true, |c| compare_tuples(&self.keys, head, c) == Ordering::Less)
                }
            };
            if better {
                best = Some(i);
            }
        }
        let Some(i) = best else { return Ok(None) };
        let run = &mut self.runs[i];
        let out = run.head.take();
        run.advance()?;
        Ok(out)
    }
}

impl Iterator for SortedRows {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.runs.is_empty() {
            return self.memory.next().map(Ok);
        }
        self.next_merged().transpose()
    }
}
