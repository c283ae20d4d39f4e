//! Flush+reload timing probe
//!
//! The probed line lives in a shared read-only mapping so it is always backed
//! by a physical page. Each repetition evicts the line and times its reload;
//! under memory bus or LLC contention from a co-resident instance the reload
//! gets slower.

use crate::error::ProbeError;
use crate::lowlevel::{self, CACHE_LINE};
use cohost_core::AgentConfig;
use memmap2::{Mmap, MmapMut};
use std::fs::File;
use std::path::PathBuf;
use tracing::{debug, info};

/// Where the probed line comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTarget {
    /// Shared read-only mapping of a file, typically a system library
    File { path: PathBuf, offset: u64 },
    /// Private anonymous mapping of `len` bytes
    Anonymous { len: usize, offset: u64 },
}

impl ProbeTarget {
    fn offset(&self) -> u64 {
        match self {
            ProbeTarget::File { offset, .. } | ProbeTarget::Anonymous { offset, .. } => *offset,
        }
    }
}

impl From<&AgentConfig> for ProbeTarget {
    fn from(config: &AgentConfig) -> Self {
        match &config.probe_file {
            Some(path) => ProbeTarget::File {
                path: path.clone(),
                offset: config.probe_offset,
            },
            None => ProbeTarget::Anonymous {
                len: 4 * 1024 * 1024,
                offset: config.probe_offset,
            },
        }
    }
}

/// One probe batch
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeBatch {
    /// Mean reload latency
    pub metric: f64,
    /// Per-repetition reload latencies
    pub samples: Vec<u64>,
}

/// Timing probe bound to one mapped line
#[derive(Debug)]
pub struct TimingProbe {
    map: Mmap,
    offset: usize,
    repetitions: usize,
}

impl TimingProbe {
    /// Map the target and resolve the probed line
    pub fn open(target: &ProbeTarget, repetitions: usize) -> Result<Self, ProbeError> {
        if repetitions == 0 {
            return Err(ProbeError::InvalidConfiguration(
                "repetitions must be > 0".to_string(),
            ));
        }

        let map = match target {
            ProbeTarget::File { path, .. } => {
                let file = File::open(path).map_err(|source| ProbeError::Open {
                    path: path.clone(),
                    source,
                })?;
                let len = file.metadata().map_err(ProbeError::Map)?.len();
                if len == 0 {
                    return Err(ProbeError::EmptyTarget(path.clone()));
                }
                lowlevel::map_shared_readonly(&file).map_err(ProbeError::Map)?
            }
            ProbeTarget::Anonymous { len, .. } => {
                if *len < CACHE_LINE {
                    return Err(ProbeError::InvalidConfiguration(
                        "anonymous probe mapping must hold at least one cache line".to_string(),
                    ));
                }
                let mut map = MmapMut::map_anon(*len).map_err(ProbeError::Map)?;
                map.fill(0x5a);
                map.make_read_only().map_err(ProbeError::Map)?
            }
        };

        let offset = resolve_offset(target.offset(), map.len());
        info!(
            "Timing probe mapped {} bytes, probing offset {:#x} with {} repetitions",
            map.len(),
            offset,
            repetitions
        );

        Ok(Self {
            map,
            offset,
            repetitions,
        })
    }

    /// Byte offset of the probed line inside the mapping
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn repetitions(&self) -> usize {
        self.repetitions
    }

    /// Run a batch with the configured repetition count
    pub fn measure(&self) -> ProbeBatch {
        self.measure_n(self.repetitions)
    }

    /// Run a batch of `repetitions` flush+reload measurements
    pub fn measure_n(&self, repetitions: usize) -> ProbeBatch {
        let line = &self.map[self.offset];
        let samples: Vec<u64> = (0..repetitions)
            .map(|_| lowlevel::flush_and_time_reload(line))
            .collect();

        let metric = if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<u64>() as f64 / samples.len() as f64
        };

        debug!("Probe batch of {}: mean {:.1}", samples.len(), metric);

        ProbeBatch { metric, samples }
    }
}

/// Wrap an offset into a mapping of `len` bytes and round it down to a line
pub fn resolve_offset(offset: u64, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let wrapped = (offset % len as u64) as usize;
    wrapped - wrapped % CACHE_LINE
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_resolve_offset() {
        assert_eq!(resolve_offset(0x16aa00, 0x200000), 0x16aa00);
        assert_eq!(resolve_offset(0x16aa00, 0x1000), 0xa00);
        assert_eq!(resolve_offset(130, 4096), 128);
        assert_eq!(resolve_offset(5000, 4096), 896);
    }

    #[test]
    fn test_file_probe() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0xabu8; 16 * 1024]).unwrap();
        file.flush().unwrap();

        let target = ProbeTarget::File {
            path: file.path().to_path_buf(),
            offset: 0x16aa00,
        };
        let probe = TimingProbe::open(&target, 200).unwrap();
        assert_eq!(probe.offset(), resolve_offset(0x16aa00, 16 * 1024));

        let batch = probe.measure();
        assert_eq!(batch.samples.len(), 200);
        assert!(batch.metric >= 0.0);
    }

    #[test]
    fn test_anonymous_probe() {
        let target = ProbeTarget::Anonymous {
            len: 64 * 1024,
            offset: 4096,
        };
        let probe = TimingProbe::open(&target, 10).unwrap();
        assert_eq!(probe.offset(), 4096);
        assert_eq!(probe.measure_n(25).samples.len(), 25);
    }

    #[test]
    fn test_empty_file_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let target = ProbeTarget::File {
            path: file.path().to_path_buf(),
            offset: 0,
        };
        assert!(matches!(
            TimingProbe::open(&target, 10),
            Err(ProbeError::EmptyTarget(_))
        ));
    }

    #[test]
    fn test_missing_file_rejected() {
        let target = ProbeTarget::File {
            path: PathBuf::from("/nonexistent/libcrypto.so.3"),
            offset: 0,
        };
        assert!(matches!(
            TimingProbe::open(&target, 10),
            Err(ProbeError::Open { .. })
        ));
    }

    #[test]
    fn test_zero_repetitions_rejected() {
        let target = ProbeTarget::Anonymous {
            len: 4096,
            offset: 0,
        };
        assert!(TimingProbe::open(&target, 0).is_err());
    }
}
