use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};

/// Encode a single record to [len][bincode][crc32] format.
fn encode_record<E: Serialize>(writer: &mut impl Write, record: &E) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only journal, generic over the record type. The ledger keeps one
/// per tenant (`LedgerEvent`); the downlink queue keeps a single global one
/// (`QueueEvent`).
///
/// Format per entry: `[u32: len][bincode: E][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - Truncated last entry (crash) is safely discarded via length-prefix + CRC check.
pub struct Wal<E> {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    _record: PhantomData<E>,
}

impl<E: Serialize + DeserializeOwned> Wal<E> {
    /// Open (or create) the journal file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
            _record: PhantomData,
        })
    }

    /// Append a single record and fsync. Used by tests only — production
    /// code uses `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, record: &E) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Append a single record to the BufWriter without flushing or syncing.
    /// Call `flush_sync()` after the batch to durably commit all buffered records.
    pub fn append_buffered(&mut self, record: &E) -> io::Result<()> {
        encode_record(&mut self.writer, record)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write compacted records to a temp file and fsync.
    /// This is the slow I/O phase — call OUTSIDE the journal lock.
    pub fn write_compact_file(path: &Path, records: &[E]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for record in records {
            encode_record(&mut writer, record)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename temp file over the journal and reopen.
    /// This is fast — call while holding the journal lock.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Replace the journal with a minimal set of records that recreates the
    /// current state. Convenience method that does both phases. Used by tests.
    #[cfg(test)]
    pub fn compact(&mut self, records: &[E]) -> io::Result<()> {
        Self::write_compact_file(&self.path, records)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the journal from disk, returning all valid records.
    /// Truncated/corrupt trailing entries are silently discarded.
    pub fn replay(path: &Path) -> io::Result<Vec<E>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();

        loop {
            // Read length prefix
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            // Read payload
            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            // Read CRC
            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            let stored_crc = u32::from_le_bytes(crc_buf);
            let computed_crc = crc32fast::hash(&payload);

            if stored_crc != computed_crc {
                // Corrupt entry — stop replaying
                break;
            }

            match bincode::deserialize::<E>(&payload) {
                Ok(record) => records.push(record),
                Err(_) => break, // corrupt payload
            }
        }

        Ok(records)
    }
}

// ── Group-commit writer ──────────────────────────────────────────

enum WalCommand<E> {
    Append {
        record: E,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<E>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns a journal and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn writer_loop<E: Serialize + DeserializeOwned>(
    journal: &'static str,
    mut wal: Wal<E>,
    mut rx: mpsc::Receiver<WalCommand<E>>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { record, response }) => {
                            batch.push((record, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_with_metrics(journal, &mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_with_metrics(journal, &mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_with_metrics<E: Serialize + DeserializeOwned>(
    journal: &'static str,
    wal: &mut Wal<E>,
    batch: &mut Vec<(E, oneshot::Sender<io::Result<()>>)>,
) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE, "journal" => journal)
        .record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS, "journal" => journal)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch<E: Serialize + DeserializeOwned>(
    wal: &mut Wal<E>,
    batch: &mut [(E, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (record, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(record) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch<E>(batch: &mut Vec<(E, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append<E: Serialize + DeserializeOwned>(wal: &mut Wal<E>, cmd: WalCommand<E>) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

fn shut_down_err() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "journal writer shut down")
}

/// Cheap clonable handle to a spawned group-commit writer.
#[derive(Clone)]
pub struct WalHandle<E> {
    tx: mpsc::Sender<WalCommand<E>>,
}

impl<E: Serialize + DeserializeOwned + Send + 'static> WalHandle<E> {
    /// Take ownership of an opened journal and spawn its writer task.
    /// `journal` labels the flush metrics ("ledger", "queue").
    pub fn spawn(wal: Wal<E>, journal: &'static str) -> Self {
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(writer_loop(journal, wal, rx));
        Self { tx }
    }

    /// Durably append one record via the group-commit batch.
    pub async fn append(&self, record: E) -> io::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Append { record, response: tx })
            .await
            .map_err(|_| shut_down_err())?;
        rx.await.map_err(|_| shut_down_err())?
    }

    /// Rewrite the journal with a minimal record set.
    pub async fn compact(&self, records: Vec<E>) -> io::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| shut_down_err())?;
        rx.await.map_err(|_| shut_down_err())?
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("placard_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn registered(id: Ulid) -> LedgerEvent {
        LedgerEvent::SpaceRegistered {
            id,
            name: None,
            sensor_dev: Ulid::new(),
            display_dev: Ulid::new(),
            gateway: Ulid::new(),
            enabled: true,
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");

        let events = vec![
            registered(Ulid::new()),
            LedgerEvent::ReservationCreated {
                id: Ulid::new(),
                space_id: Ulid::new(),
                span: Span::new(1_000_000, 2_000_000),
                request_id: "req-1".into(),
                created_at: 999,
            },
        ];

        {
            let mut wal: Wal<LedgerEvent> = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        let replayed = Wal::<LedgerEvent>::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed, events);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");

        let event = registered(Ulid::new());

        {
            let mut wal: Wal<LedgerEvent> = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }

        // Append garbage to simulate a truncated second entry
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap(); // partial length + some bytes
        }

        let replayed = Wal::<LedgerEvent>::replay(&path).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0], event);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        let replayed = Wal::<LedgerEvent>::replay(&path).unwrap();
        assert!(replayed.is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");

        let event = LedgerEvent::SpaceRemoved { id: Ulid::new() };

        // Manually write an entry with bad CRC
        {
            let payload = bincode::serialize(&event).unwrap();
            let len = payload.len() as u32;
            let bad_crc: u32 = 0xDEADBEEF;

            let mut f = File::create(&path).unwrap();
            f.write_all(&len.to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&bad_crc.to_le_bytes()).unwrap();
        }

        let replayed = Wal::<LedgerEvent>::replay(&path).unwrap();
        assert!(replayed.is_empty());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_reduces_wal() {
        let path = tmp_path("compact_reduce.wal");

        let sid = Ulid::new();

        // Write churn: a space plus repeated occupancy flips
        {
            let mut wal: Wal<LedgerEvent> = Wal::open(&path).unwrap();
            wal.append(&registered(sid)).unwrap();
            for seq in 0..20u32 {
                wal.append(&LedgerEvent::OccupancyRecorded {
                    space_id: sid,
                    state: if seq % 2 == 0 {
                        OccupancyState::Occupied
                    } else {
                        OccupancyState::Free
                    },
                    at: 1_000 + seq as Ms,
                    device: Ulid::new(),
                    frame_seq: seq,
                })
                .unwrap();
            }
        }

        let before = fs::metadata(&path).unwrap().len();
        assert!(before > 0);

        // Compact: final state is just the space
        let compacted = vec![registered(sid)];
        {
            let mut wal: Wal<LedgerEvent> = Wal::open(&path).unwrap();
            wal.compact(&compacted).unwrap();
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

        let replayed = Wal::<LedgerEvent>::replay(&path).unwrap();
        assert_eq!(replayed, compacted);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");

        let sid = Ulid::new();
        let compacted = vec![registered(sid)];

        let new_event = LedgerEvent::ReservationCreated {
            id: Ulid::new(),
            space_id: sid,
            span: Span::new(1_000_000, 2_000_000),
            request_id: "req-after-compact".into(),
            created_at: 7,
        };

        {
            let mut wal: Wal<LedgerEvent> = Wal::open(&path).unwrap();
            wal.append(&compacted[0]).unwrap();
            wal.compact(&compacted).unwrap();
            wal.append(&new_event).unwrap();
        }

        let replayed = Wal::<LedgerEvent>::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0], compacted[0]);
        assert_eq!(replayed[1], new_event);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");

        let events: Vec<LedgerEvent> = (0..5).map(|_| registered(Ulid::new())).collect();

        {
            let mut wal: Wal<LedgerEvent> = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        let replayed = Wal::<LedgerEvent>::replay(&path).unwrap();
        assert_eq!(replayed, events);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn queue_records_replay() {
        let path = tmp_path("queue_records.wal");

        let item = DownlinkItem {
            id: Ulid::new(),
            space: Ulid::new(),
            device: Ulid::new(),
            gateway: Ulid::new(),
            payload: vec![0x02, 0x00],
            fport: 10,
            hash: content_hash(10, &[0x02, 0x00]),
            created_at: 5_000,
            attempts: 0,
            next_eligible: 5_000,
            status: DownlinkStatus::Pending,
        };

        {
            let mut wal: Wal<QueueEvent> = Wal::open(&path).unwrap();
            wal.append(&QueueEvent::Enqueued { item: item.clone() }).unwrap();
            wal.append(&QueueEvent::Delivered {
                id: item.id,
                device: item.device,
                hash: item.hash,
                at: 6_000,
            })
            .unwrap();
        }

        let replayed = Wal::<QueueEvent>::replay(&path).unwrap();
        assert_eq!(replayed.len(), 2);
        assert!(matches!(replayed[0], QueueEvent::Enqueued { .. }));
        assert!(matches!(replayed[1], QueueEvent::Delivered { .. }));

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn handle_group_commits_concurrent_appends() {
        let path = tmp_path("handle_group_commit.wal");

        let wal: Wal<LedgerEvent> = Wal::open(&path).unwrap();
        let handle = WalHandle::spawn(wal, "test");

        let mut joins = Vec::new();
        for _ in 0..32 {
            let h = handle.clone();
            joins.push(tokio::spawn(async move {
                h.append(registered(Ulid::new())).await
            }));
        }
        for j in joins {
            j.await.unwrap().unwrap();
        }

        let replayed = Wal::<LedgerEvent>::replay(&path).unwrap();
        assert_eq!(replayed.len(), 32);

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn handle_compact_resets_append_counter() {
        let path = tmp_path("handle_compact.wal");

        let wal: Wal<LedgerEvent> = Wal::open(&path).unwrap();
        let handle = WalHandle::spawn(wal, "test");

        let keep = registered(Ulid::new());
        for _ in 0..5 {
            handle.append(registered(Ulid::new())).await.unwrap();
        }
        assert_eq!(handle.appends_since_compact().await, 5);

        handle.compact(vec![keep.clone()]).await.unwrap();
        assert_eq!(handle.appends_since_compact().await, 0);

        let replayed = Wal::<LedgerEvent>::replay(&path).unwrap();
        assert_eq!(replayed, vec![keep]);

        let _ = fs::remove_file(&path);
    }
}
