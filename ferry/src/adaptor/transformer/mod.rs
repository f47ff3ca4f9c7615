//! Intermediate node rewriting messages on their way to the sinks below it.

mod transforms;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::info;

pub use transforms::{Transform, build_chain};

use crate::adaptor::{Adaptor, AdaptorConfig, MATCH_ALL};
use crate::error::FerryResult;
use crate::pipe::{ApplyChain, Pipe};

const DESCRIPTION: &str = "an adaptor that transforms documents using built-in steps";

const SAMPLE_CONFIG: &str = r#"- name: trans
  type: transformer
  parent: source
  options:
    transforms:
      - type: denormalize_id
      - type: rename_field
        from: total
        to: amount
      - type: skip_operations
        operations: [delete]"#;

/// Settings of a transformer node.
#[derive(Debug, Clone, Deserialize)]
pub struct TransformerConfig {
    pub transforms: Vec<Transform>,
}

pub struct TransformerAdaptor {
    path: String,
    pipe: Pipe,
    chain: ApplyChain,
}

impl TransformerAdaptor {
    pub fn new(pipe: Pipe, path: impl Into<String>, config: &AdaptorConfig) -> FerryResult<Self> {
        let config: TransformerConfig = config.construct()?;

        Ok(Self {
            path: path.into(),
            pipe,
            chain: build_chain(&config.transforms),
        })
    }
}

#[async_trait]
impl Adaptor for TransformerAdaptor {
    fn description(&self) -> &'static str {
        DESCRIPTION
    }

    fn sample_config(&self) -> &'static str {
        SAMPLE_CONFIG
    }

    async fn connect(&self) -> FerryResult<()> {
        Ok(())
    }

    async fn listen(&self) -> FerryResult<()> {
        let match_all = Regex::new(MATCH_ALL)?;
        info!(path = %self.path, steps = self.chain.len(), "transformer listening");

        let chain = self.chain.clone();
        self.pipe
            .listen(
                move |message| {
                    let chain = chain.clone();
                    async move { chain.apply(message).await }
                },
                &match_all,
            )
            .await
    }

    async fn stop(&self) -> FerryResult<()> {
        self.pipe.stop().await;

        Ok(())
    }
}
