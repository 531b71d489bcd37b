// Static fan-out table: record type tag to the ordered producer list, plus
// the at-most-one designated ack source per tag. Built once at startup and
// read without synchronization afterwards.
use std::collections::HashMap;
use std::sync::Arc;

use crate::producer::Producer;
use crate::record::{Origin, Record};

pub type Result<T> = std::result::Result<T, RouterError>;

#[derive(thiserror::Error, Debug)]
pub enum RouterError {
    #[error("record type {type_tag:?} routes to unknown producer {producer:?}")]
    UnknownProducer { type_tag: String, producer: String },
    #[error("ack source {producer:?} for {type_tag:?} is not in that tag's fan-out list")]
    AckSourceNotInFanout { type_tag: String, producer: String },
}

pub struct RouteTable {
    routes: HashMap<String, Vec<Arc<dyn Producer>>>,
    ack_sources: HashMap<String, String>,
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTable")
            .field(
                "routes",
                &self
                    .routes
                    .iter()
                    .map(|(tag, producers)| {
                        (
                            tag.clone(),
                            producers.iter().map(|p| p.name().to_string()).collect::<Vec<_>>(),
                        )
                    })
                    .collect::<HashMap<_, _>>(),
            )
            .field("ack_sources", &self.ack_sources)
            .finish()
    }
}

impl RouteTable {
    /// Build and validate the table from the configured maps and the
    /// constructed producer set. Violations abort startup.
    pub fn build(
        records: &HashMap<String, Vec<String>>,
        ack_sources: &HashMap<String, String>,
        producers: &HashMap<String, Arc<dyn Producer>>,
    ) -> Result<Self> {
        let mut routes: HashMap<String, Vec<Arc<dyn Producer>>> = HashMap::new();
        for (type_tag, names) in records {
            let mut fanout = Vec::with_capacity(names.len());
            for name in names {
                let producer =
                    producers
                        .get(name)
                        .ok_or_else(|| RouterError::UnknownProducer {
                            type_tag: type_tag.clone(),
                            producer: name.clone(),
                        })?;
                fanout.push(Arc::clone(producer));
            }
            routes.insert(type_tag.clone(), fanout);
        }
        for (type_tag, name) in ack_sources {
            let in_fanout = records
                .get(type_tag)
                .map(|names| names.iter().any(|n| n == name))
                .unwrap_or(false);
            if !in_fanout {
                return Err(RouterError::AckSourceNotInFanout {
                    type_tag: type_tag.clone(),
                    producer: name.clone(),
                });
            }
        }
        Ok(Self {
            routes,
            ack_sources: ack_sources.clone(),
        })
    }

    /// Designated ack source for a tag, if one is configured.
    pub fn ack_source(&self, type_tag: &str) -> Option<&str> {
        self.ack_sources.get(type_tag).map(String::as_str)
    }

    /// Whether a record should be tracked for an end-to-end ack. Synthetic
    /// records never are.
    pub fn is_ack_eligible(&self, record: &Record) -> bool {
        record.origin == Origin::Vehicle && self.ack_sources.contains_key(&record.type_tag)
    }

    /// Type tags a given backend is the designated ack source for. Handed
    /// to that backend's adapter at construction.
    pub fn ack_source_tags(&self, backend: &str) -> Vec<String> {
        self.ack_sources
            .iter()
            .filter(|(_, name)| name.as_str() == backend)
            .map(|(tag, _)| tag.clone())
            .collect()
    }

    /// Fan a record out to every producer configured for its tag, in
    /// order. Submit semantics: a producer error is logged and counted,
    /// then the remaining producers still get the record. No retries here;
    /// retry policy belongs to the adapters.
    pub async fn dispatch(&self, record: &Record) {
        let Some(fanout) = self.routes.get(&record.type_tag) else {
            metrics::counter!(
                "fleetline_records_dropped_total",
                "reason" => "unknown_tag",
                "record_type" => record.type_tag.clone()
            )
            .increment(1);
            tracing::debug!(
                type_tag = %record.type_tag,
                device_id = %record.identity.device_id(),
                "record for unconfigured tag dropped"
            );
            return;
        };
        metrics::counter!(
            "fleetline_records_routed_total",
            "record_type" => record.type_tag.clone()
        )
        .increment(1);
        for producer in fanout {
            match producer.publish(record).await {
                Ok(()) => {
                    metrics::counter!(
                        "fleetline_producer_publish_total",
                        "backend" => producer.name().to_string(),
                        "record_type" => record.type_tag.clone()
                    )
                    .increment(1);
                }
                Err(err) => {
                    metrics::counter!(
                        "fleetline_producer_publish_errors_total",
                        "backend" => producer.name().to_string(),
                        "record_type" => record.type_tag.clone()
                    )
                    .increment(1);
                    tracing::warn!(
                        backend = producer.name(),
                        type_tag = %record.type_tag,
                        txid = %record.txid_hex(),
                        error = %err,
                        "producer publish failed"
                    );
                }
            }
        }
    }
}
