//! Pcap file backend

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use super::{pcap, DumpBackend};
use crate::error::{BackendInitError, BackendWriteError};
use crate::models::{DumpMode, PacketRecord};

pub struct PcapFileBackend {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    snaplen: u32,
    /// Set once a write failed; the file is no longer extended after that
    failed: Option<io::ErrorKind>,
    records: u64,
}

impl PcapFileBackend {
    /// Create (or truncate) `path` and write the pcap global header
    pub fn create(path: impl AsRef<Path>, snaplen: u32) -> Result<Self, BackendInitError> {
        let path = path.as_ref().to_path_buf();
        let open_failed = |source| BackendInitError::FileOpenFailed {
            path: path.clone(),
            source,
        };

        let file = File::create(&path).map_err(open_failed)?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(&pcap::global_header(snaplen))
            .map_err(open_failed)?;

        tracing::info!("Writing pcap dump to {}", path.display());
        Ok(Self {
            path,
            writer: Some(writer),
            snaplen,
            failed: None,
            records: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records_written(&self) -> u64 {
        self.records
    }

    fn classify(&self, err: io::Error) -> BackendWriteError {
        if !self.path.exists() {
            BackendWriteError::StorageLost(self.path.clone())
        } else {
            BackendWriteError::IoFailure(err)
        }
    }
}

impl DumpBackend for PcapFileBackend {
    fn mode(&self) -> DumpMode {
        DumpMode::PcapFile {
            path: self.path.clone(),
        }
    }

    fn write(&mut self, record: &PacketRecord) -> Result<(), BackendWriteError> {
        if let Some(kind) = self.failed {
            return Err(BackendWriteError::IoFailure(io::Error::new(
                kind,
                "pcap file writer stopped after an earlier failure",
            )));
        }
        let Some(writer) = self.writer.as_mut() else {
            return Err(BackendWriteError::IoFailure(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pcap file already closed",
            )));
        };

        let encoded = pcap::encode_record(record, self.snaplen);
        match writer.write_all(&encoded) {
            Ok(()) => {
                self.records += 1;
                Ok(())
            }
            Err(err) => {
                self.failed = Some(err.kind());
                Err(self.classify(err))
            }
        }
    }

    fn flush(&mut self) -> Result<(), BackendWriteError> {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(err) = writer.flush() {
                self.failed.get_or_insert(err.kind());
                return Err(self.classify(err));
            }
        }
        // An unlinked file keeps accepting writes, so check for it explicitly
        if !self.path.exists() {
            return Err(BackendWriteError::StorageLost(self.path.clone()));
        }
        Ok(())
    }

    fn flush_and_close(&mut self) -> Result<(), BackendWriteError> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        writer.flush()?;
        writer.get_ref().sync_all()?;
        tracing::info!(
            "Closed pcap dump {} ({} records)",
            self.path.display(),
            self.records
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;
    use chrono::Utc;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn written_records_round_trip_byte_for_byte() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.pcap");
        let mut backend = PcapFileBackend::create(&path, 65535).unwrap();

        let originals: Vec<PacketRecord> = (0..25u8)
            .map(|i| {
                let direction = if i % 2 == 0 {
                    Direction::Sent
                } else {
                    Direction::Received
                };
                PacketRecord::new(Utc::now(), direction, vec![i; 20 + i as usize])
            })
            .collect();
        for record in &originals {
            backend.write(record).unwrap();
        }
        backend.flush_and_close().unwrap();

        let parsed = pcap::read_pcap(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(parsed.records.len(), originals.len());
        for (got, want) in parsed.records.iter().zip(&originals) {
            assert_eq!(got.payload, want.payload);
        }
        assert_eq!(backend.records_written(), 25);
    }

    #[test]
    fn missing_directory_fails_to_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope").join("out.pcap");
        assert!(matches!(
            PcapFileBackend::create(&path, 65535),
            Err(BackendInitError::FileOpenFailed { .. })
        ));
    }

    #[test]
    fn removed_file_is_reported_as_lost_storage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone.pcap");
        let mut backend = PcapFileBackend::create(&path, 65535).unwrap();
        fs::remove_file(&path).unwrap();

        let err = backend.flush().unwrap_err();
        assert!(err.is_unrecoverable());
    }

    #[test]
    fn writes_after_close_fail_without_panicking() {
        let dir = tempdir().unwrap();
        let mut backend = PcapFileBackend::create(dir.path().join("a.pcap"), 65535).unwrap();
        backend.flush_and_close().unwrap();
        let record = PacketRecord::new(Utc::now(), Direction::Sent, vec![1, 2, 3]);
        assert!(backend.write(&record).is_err());
        assert!(backend.flush_and_close().is_ok());
    }
}
