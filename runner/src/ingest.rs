use crate::{adapter::AdapterOutput, config::IngestorConfig};
use serde_yaml::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, error};

/// metric name -> value, `None` when the metric could not be measured
pub type Metrics = BTreeMap<String, Option<f64>>;

#[derive(Debug, Error)]
pub enum IngestorError {
    #[error("Failed to deserialize assistant output")]
    DeserializeIngestor(#[from] serde_yaml::Error),
    #[error("Assistant output is not a mapping of metrics")]
    NotAMapping,
}

/// Turns the output of an assistant into metrics
#[derive(Clone, Debug)]
pub enum Ingestors {
    /// declares the metrics but never measures them
    Null { metrics: Vec<String> },
    /// reads the declared metrics from a YAML mapping printed by the assistant
    Yaml { metrics: Vec<String> },
}

impl Ingestors {
    pub fn load(config: &IngestorConfig) -> Self {
        match config {
            IngestorConfig::Null { metrics } => Self::Null {
                metrics: metrics.clone(),
            },
            IngestorConfig::Yaml { metrics } => Self::Yaml {
                metrics: metrics.clone(),
            },
        }
    }

    pub fn metric_names(&self) -> &[String] {
        match self {
            Self::Null { metrics } | Self::Yaml { metrics } => metrics,
        }
    }

    /// every declared metric set to `None`
    pub fn empty(&self) -> Metrics {
        self.metric_names()
            .iter()
            .map(|name| (name.clone(), None))
            .collect()
    }

    #[tracing::instrument(level = "debug", skip(output))]
    pub fn ingest(&self, output: &AdapterOutput) -> Result<Metrics, IngestorError> {
        match self {
            Self::Null { .. } => Ok(self.empty()),
            Self::Yaml { metrics } => {
                let value = match serde_yaml::from_str::<Value>(&output.output) {
                    Ok(value) => value,
                    Err(error) => {
                        error!(error = ?error, "Failed to deserialize metrics for yaml ingestor");

                        return Err(IngestorError::DeserializeIngestor(error));
                    }
                };
                let Value::Mapping(mapping) = value else {
                    return Err(IngestorError::NotAMapping);
                };

                Ok(metrics
                    .iter()
                    .map(|name| {
                        let measured = mapping.get(name.as_str()).and_then(Value::as_f64);

                        if measured.is_none() {
                            debug!(metric = %name, "Metric missing or not numeric");
                        }

                        (name.clone(), measured)
                    })
                    .collect())
            }
        }
    }
}
