//! In-memory time-series store, the default backend (spec.md §6). Optional
//! CSV mirroring turns the same in-memory buffer into the `csv` backend:
//! every `commit()` appends newly-inserted points to the configured file,
//! matching the source's CSV adapter being "the memory adapter plus a
//! sidecar file" rather than a separate storage engine.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Measurement, Point, TimeSeriesStore, TimeseriesError};

pub struct MemoryTimeSeriesStore {
    points: Vec<Point>,
    connected: bool,
    csv_mirror: Option<PathBuf>,
    uncommitted: usize,
}

impl MemoryTimeSeriesStore {
    pub fn new() -> Self {
        MemoryTimeSeriesStore { points: Vec::new(), connected: false, csv_mirror: None, uncommitted: 0 }
    }

    pub fn with_csv_mirror(dbfile: String) -> Self {
        MemoryTimeSeriesStore {
            points: Vec::new(),
            connected: false,
            csv_mirror: Some(PathBuf::from(dbfile)),
            uncommitted: 0,
        }
    }

    fn flush_csv(&mut self) -> Result<(), TimeseriesError> {
        let Some(path) = &self.csv_mirror else { return Ok(()) };
        if self.uncommitted == 0 {
            return Ok(());
        }
        let write_header = !path.exists();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| TimeseriesError::Write(e.to_string()))?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if write_header {
            writer
                .write_record(["measurement", "host", "vm", "field", "value", "recorded_at"])
                .map_err(|e| TimeseriesError::Write(e.to_string()))?;
        }
        let start = self.points.len() - self.uncommitted;
        for point in &self.points[start..] {
            for (field, value) in &point.fields {
                writer
                    .write_record([
                        point.measurement.to_string(),
                        point.host.clone(),
                        point.vm.clone(),
                        field.clone(),
                        value.to_string(),
                        point.recorded_at.to_rfc3339(),
                    ])
                    .map_err(|e| TimeseriesError::Write(e.to_string()))?;
            }
        }
        writer.flush().map_err(|e| TimeseriesError::Write(e.to_string()))?;
        self.uncommitted = 0;
        Ok(())
    }
}

impl Default for MemoryTimeSeriesStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryTimeSeriesStore {
    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn open(&mut self) -> Result<(), TimeseriesError> {
        self.connected = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TimeseriesError> {
        self.flush_csv()?;
        self.connected = false;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), TimeseriesError> {
        self.flush_csv()
    }

    async fn insert(&mut self, point: Point) -> Result<(), TimeseriesError> {
        if !self.connected {
            return Err(TimeseriesError::NotConnected);
        }
        self.points.push(point);
        self.uncommitted += 1;
        Ok(())
    }

    async fn insert_batch(&mut self, points: Vec<Point>) -> Result<(), TimeseriesError> {
        if !self.connected {
            return Err(TimeseriesError::NotConnected);
        }
        self.uncommitted += points.len();
        self.points.extend(points);
        Ok(())
    }

    async fn get_all(
        &self,
        measurement: Measurement,
        host: &str,
        vm: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Point>, TimeseriesError> {
        if !self.connected {
            return Err(TimeseriesError::NotConnected);
        }
        Ok(self
            .points
            .iter()
            .filter(|p| p.measurement == measurement && p.host == host && p.vm == vm && p.recorded_at >= since)
            .cloned()
            .collect())
    }

    async fn clear(&mut self) -> Result<(), TimeseriesError> {
        self.points.clear();
        self.uncommitted = 0;
        Ok(())
    }

    async fn run_retention_policy(&mut self, trailing_secs: u64) -> Result<(), TimeseriesError> {
        let cutoff = Utc::now() - chrono::Duration::seconds(trailing_secs as i64);
        self.points.retain(|p| p.recorded_at >= cutoff);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn point(measurement: Measurement, at: DateTime<Utc>) -> Point {
        Point { measurement, host: "h1".into(), vm: "vm1".into(), fields: HashMap::new(), recorded_at: at }
    }

    #[tokio::test]
    async fn get_all_filters_by_measurement_and_since() {
        let mut store = MemoryTimeSeriesStore::new();
        store.open().await.unwrap();
        let now = Utc::now();
        store.insert(point(Measurement::Cpu, now - chrono::Duration::seconds(30))).await.unwrap();
        store.insert(point(Measurement::Cpu, now)).await.unwrap();
        store.insert(point(Measurement::Net, now)).await.unwrap();

        let rows = store.get_all(Measurement::Cpu, "h1", "vm1", now - chrono::Duration::seconds(5)).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn retention_policy_drops_old_points() {
        let mut store = MemoryTimeSeriesStore::new();
        store.open().await.unwrap();
        store.insert(point(Measurement::Cpu, Utc::now() - chrono::Duration::seconds(1_000))).await.unwrap();
        store.run_retention_policy(60).await.unwrap();
        let rows = store.get_all(Measurement::Cpu, "h1", "vm1", Utc::now() - chrono::Duration::seconds(2_000)).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn insert_before_open_is_rejected() {
        let mut store = MemoryTimeSeriesStore::new();
        let err = store.insert(point(Measurement::Cpu, Utc::now())).await;
        assert!(matches!(err, Err(TimeseriesError::NotConnected)));
    }
}
