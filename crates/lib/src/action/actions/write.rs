//! Literal-content and no-op transformations.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::action::{ExecContext, Executable, StepError};
use crate::artifact::{Artifact, pack_outputs_async};

/// Write the same literal content to every declared output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteStep {
  pub content: String,
}

impl WriteStep {
  pub fn new(content: &str) -> Self {
    Self {
      content: content.to_string(),
    }
  }
}

#[async_trait]
impl Executable for WriteStep {
  fn type_tag(&self) -> &str {
    "write"
  }

  fn key_fields(&self) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    fields.insert("content".to_string(), self.content.clone());
    fields
  }

  async fn execute(&self, ctx: &ExecContext) -> Result<Artifact, StepError> {
    for output in &ctx.outputs {
      if ctx.cancel.is_cancelled() {
        return Err(StepError::Cancelled);
      }
      let path = ctx.out_dir.join(output);
      if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
      }
      tokio::fs::write(&path, self.content.as_bytes()).await?;
    }
    Ok(pack_outputs_async(&ctx.out_dir, &ctx.outputs).await?)
  }
}

/// An action without build steps, such as a grouping target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoopStep;

#[async_trait]
impl Executable for NoopStep {
  fn type_tag(&self) -> &str {
    "noop"
  }

  async fn execute(&self, _ctx: &ExecContext) -> Result<Artifact, StepError> {
    Ok(Artifact::empty())
  }
}
