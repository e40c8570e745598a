//! Tera templates used by rule nodes
//!
//! Templates see the message as:
//! - `msg`: the JSON payload
//! - `metadata`: the string metadata map
//! - `msg_type`, `originator` (`tenant_id`, `entity_type`, `entity_id`), `ts`

use tera::{Context, Tera};

use crate::domain::{error::PipelineError, message::Message};

#[derive(Debug, Default)]
pub struct TemplateSet {
    tera: Tera
}

impl TemplateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template; syntax errors are chain configuration errors
    pub fn add(&mut self, name: &str, source: &str) -> Result<(), PipelineError> {
        self.tera.add_raw_template(name, source).map_err(|e| {
            PipelineError::ChainConfiguration(format!("invalid template {}: {}", name, PipelineError::from(e)))
        })
    }

    /// Register a boolean condition under `name`
    pub fn add_condition(&mut self, name: &str, condition: &str) -> Result<(), PipelineError> {
        self.add(name, &format!("{{% if {} %}}true{{% else %}}false{{% endif %}}", condition))
    }

    pub fn render(&self, name: &str, message: &Message) -> Result<String, PipelineError> {
        Ok(self.tera.render(name, &Self::context(message))?)
    }

    pub fn evaluate(&self, name: &str, message: &Message) -> Result<bool, PipelineError> {
        match self.render(name, message)?.trim() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(PipelineError::Evaluation(format!("condition {} rendered {:?}", name, other)))
        }
    }

    fn context(message: &Message) -> Context {
        let mut context = Context::new();
        context.insert("msg", &message.payload);
        context.insert("metadata", &message.metadata);
        context.insert("msg_type", message.msg_type.as_str());
        context.insert("originator", &message.originator);
        context.insert("ts", &message.ts_millis());
        context
    }
}
