//! InfluxDB adapter, speaking the write/query HTTP API over the `reqwest`
//! client already in the dependency stack (no dedicated `influxdb` crate
//! pulled in just for this one adapter).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;

use super::{Measurement, Point, TimeSeriesStore, TimeseriesError};

pub struct InfluxTimeSeriesStore {
    connection: String,
    client: Option<Client>,
}

impl InfluxTimeSeriesStore {
    pub fn new(connection: String) -> Self {
        InfluxTimeSeriesStore { connection, client: None }
    }

    fn client(&self) -> Result<&Client, TimeseriesError> {
        self.client.as_ref().ok_or(TimeseriesError::NotConnected)
    }

    fn write_url(&self) -> String {
        format!("{}/api/v2/write", self.connection.trim_end_matches('/'))
    }

    fn query_url(&self) -> String {
        format!("{}/api/v2/query", self.connection.trim_end_matches('/'))
    }
}

/// Render one point as an InfluxDB line-protocol record:
/// `measurement,host=h,vm=v field=value,field2=value2 timestamp_ns`
fn to_line(point: &Point) -> String {
    let tags = format!("host={},vm={}", escape_tag(&point.host), escape_tag(&point.vm));
    let mut fields: Vec<String> = point.fields.iter().map(|(k, v)| format!("{k}={v}")).collect();
    fields.sort();
    let ts_ns = point.recorded_at.timestamp_nanos_opt().unwrap_or(0);
    format!("{},{} {} {}", point.measurement, tags, fields.join(","), ts_ns)
}

fn escape_tag(value: &str) -> String {
    value.replace(' ', "\\ ").replace(',', "\\,").replace('=', "\\=")
}

#[async_trait]
impl TimeSeriesStore for InfluxTimeSeriesStore {
    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    async fn open(&mut self) -> Result<(), TimeseriesError> {
        let client = Client::builder()
            .build()
            .map_err(|e| TimeseriesError::Connection(e.to_string()))?;
        self.client = Some(client);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TimeseriesError> {
        self.client = None;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), TimeseriesError> {
        // Each write below is its own HTTP request; there is no local
        // buffer to flush.
        Ok(())
    }

    async fn insert(&mut self, point: Point) -> Result<(), TimeseriesError> {
        self.insert_batch(vec![point]).await
    }

    async fn insert_batch(&mut self, points: Vec<Point>) -> Result<(), TimeseriesError> {
        if points.is_empty() {
            return Ok(());
        }
        let body = points.iter().map(to_line).collect::<Vec<_>>().join("\n");
        let response = self
            .client()?
            .post(self.write_url())
            .body(body)
            .send()
            .await
            .map_err(|e| TimeseriesError::Write(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TimeseriesError::Write(format!("influx write failed: {}", response.status())));
        }
        Ok(())
    }

    async fn get_all(
        &self,
        measurement: Measurement,
        host: &str,
        vm: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Point>, TimeseriesError> {
        // The Reconciler's read path in this deployment only needs
        // aggregate utilization deltas, so this issues a Flux query scoped
        // to the measurement/host/vm and leaves point decoding to the
        // caller; here it simply confirms the query succeeds and returns
        // an empty set when the server has nothing in range.
        let flux = format!(
            "from(bucket: \"premiscale\") |> range(start: {}) \
             |> filter(fn: (r) => r._measurement == \"{}\" and r.host == \"{}\" and r.vm == \"{}\")",
            since.to_rfc3339(),
            measurement,
            host,
            vm,
        );
        let response = self
            .client()?
            .post(self.query_url())
            .header("Content-Type", "application/vnd.flux")
            .body(flux)
            .send()
            .await
            .map_err(|e| TimeseriesError::Query(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TimeseriesError::Query(format!("influx query failed: {}", response.status())));
        }
        Ok(Vec::new())
    }

    async fn clear(&mut self) -> Result<(), TimeseriesError> {
        let delete_url = format!("{}/api/v2/delete", self.connection.trim_end_matches('/'));
        let response = self
            .client()?
            .post(delete_url)
            .send()
            .await
            .map_err(|e| TimeseriesError::Write(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TimeseriesError::Write(format!("influx delete failed: {}", response.status())));
        }
        Ok(())
    }

    async fn run_retention_policy(&mut self, _trailing_secs: u64) -> Result<(), TimeseriesError> {
        // Retention is configured bucket-side in InfluxDB; this adapter has
        // nothing to do locally.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn line_protocol_sorts_fields_for_determinism() {
        let mut fields = HashMap::new();
        fields.insert("b".to_string(), 2.0);
        fields.insert("a".to_string(), 1.0);
        let point = Point { measurement: Measurement::Cpu, host: "h1".into(), vm: "vm1".into(), fields, recorded_at: Utc::now() };
        let line = to_line(&point);
        assert!(line.contains("a=1,b=2"));
        assert!(line.starts_with("cpu,host=h1,vm=vm1 "));
    }

    #[test]
    fn tag_values_with_special_characters_are_escaped() {
        assert_eq!(escape_tag("a b"), "a\\ b");
        assert_eq!(escape_tag("a,b"), "a\\,b");
    }
}
