//! Installed rule chains and their tenant bindings
//!
//! A tenant has a default chain and may override it per entity type. Installing
//! a new version swaps the compiled chain atomically; contexts keep the chain
//! they resolved at dequeue time.

use std::{collections::HashMap, path::Path, sync::Arc};

use tokio::sync::RwLock;
use tracing::{Level, event};

use crate::{
    domain::{
        chain::{ChainId, RuleChainDef},
        constant::engine,
        entity::{EntityKey, EntityType, TenantId},
        error::PipelineError
    },
    engine::compiled::CompiledChain
};

pub struct ChainRegistry {
    default_hop_budget: u32,
    chains:             RwLock<HashMap<ChainId, Arc<CompiledChain>>>,
    bindings:           RwLock<HashMap<(TenantId, Option<EntityType>), ChainId>>
}

impl ChainRegistry {
    pub fn new(default_hop_budget: u32) -> Self {
        Self { default_hop_budget, chains: RwLock::new(HashMap::new()), bindings: RwLock::new(HashMap::new()) }
    }

    /// Compile and install a chain. Older versions than the installed one are refused;
    /// reinstalling the same version replaces it under a new generation.
    pub async fn install(&self, def: &RuleChainDef) -> Result<Arc<CompiledChain>, PipelineError> {
        let compiled = match CompiledChain::compile(def, self.default_hop_budget) {
            Ok(compiled) => Arc::new(compiled),
            Err(e) => {
                event!(Level::WARN, event = engine::CHAIN_REJECTED, chain = %def.id, error = %e);
                return Err(e);
            }
        };

        let mut chains = self.chains.write().await;
        if let Some(installed) = chains.get(&def.id)
            && installed.version > compiled.version
        {
            return Err(PipelineError::ChainConfiguration(format!(
                "chain {} version {} is older than installed version {}",
                def.id, compiled.version, installed.version
            )));
        }
        chains.insert(def.id.clone(), compiled.clone());

        event!(Level::INFO, event = engine::CHAIN_INSTALLED, chain = %def.id, version = compiled.version,
               nodes = compiled.len());
        Ok(compiled)
    }

    pub async fn install_file(&self, path: &Path) -> Result<Arc<CompiledChain>, PipelineError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PipelineError::Configuration(format!("failed to read chain {}: {}", path.display(), e)))?;
        self.install(&RuleChainDef::from_yaml(&content)?).await
    }

    /// Bind a chain to a tenant, or to one entity type of the tenant
    pub async fn bind(
        &self,
        tenant: TenantId,
        entity_type: Option<EntityType>,
        chain: ChainId
    ) -> Result<(), PipelineError> {
        if !self.chains.read().await.contains_key(&chain) {
            return Err(PipelineError::ChainConfiguration(format!("cannot bind unknown chain {}", chain)));
        }

        event!(Level::INFO, event = engine::CHAIN_BOUND, tenant = %tenant,
               entity_type = entity_type.map(|kind| kind.as_str()).unwrap_or("*"), chain = %chain);
        self.bindings.write().await.insert((tenant, entity_type), chain);
        Ok(())
    }

    /// Chain for an entity: entity-type override first, then the tenant default
    pub async fn resolve(&self, key: &EntityKey) -> Option<Arc<CompiledChain>> {
        let chain_id = {
            let bindings = self.bindings.read().await;
            bindings
                .get(&(key.tenant_id.clone(), Some(key.entity_type)))
                .or_else(|| bindings.get(&(key.tenant_id.clone(), None)))
                .cloned()?
        };
        self.chains.read().await.get(&chain_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(id: &str, version: u64) -> RuleChainDef {
        RuleChainDef::from_yaml(&format!(
            "id: {}\nname: {}\nversion: {}\nroot: a\nnodes:\n  - {{ id: a, type: ack }}\n",
            id, id, version
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_entity_type_override_wins() {
        let registry = ChainRegistry::new(16);
        registry.install(&def("default", 1)).await.unwrap();
        registry.install(&def("gateways", 1)).await.unwrap();
        registry.bind(TenantId::new("acme"), None, ChainId::new("default")).await.unwrap();
        registry.bind(TenantId::new("acme"), Some(EntityType::Gateway), ChainId::new("gateways")).await.unwrap();

        let device = registry.resolve(&EntityKey::device("acme", "d1")).await.unwrap();
        assert_eq!(device.id, ChainId::new("default"));
        let gateway = registry.resolve(&EntityKey::new("acme", EntityType::Gateway, "g1")).await.unwrap();
        assert_eq!(gateway.id, ChainId::new("gateways"));
        assert!(registry.resolve(&EntityKey::device("globex", "d1")).await.is_none());
    }

    #[tokio::test]
    async fn test_version_swap_keeps_resolved_chain() {
        let registry = ChainRegistry::new(16);
        registry.install(&def("main", 1)).await.unwrap();
        registry.bind(TenantId::new("acme"), None, ChainId::new("main")).await.unwrap();

        let captured = registry.resolve(&EntityKey::device("acme", "d1")).await.unwrap();
        registry.install(&def("main", 2)).await.unwrap();

        assert_eq!(captured.version, 1);
        assert_eq!(registry.resolve(&EntityKey::device("acme", "d1")).await.unwrap().version, 2);
        assert!(registry.install(&def("main", 1)).await.is_err());
    }

    #[tokio::test]
    async fn test_same_version_reinstall_replaces_chain() {
        let registry = ChainRegistry::new(16);
        let first = registry.install(&def("main", 3)).await.unwrap();
        registry.bind(TenantId::new("acme"), None, ChainId::new("main")).await.unwrap();
        let second = registry.install(&def("main", 3)).await.unwrap();

        let resolved = registry.resolve(&EntityKey::device("acme", "d1")).await.unwrap();
        assert!(Arc::ptr_eq(&resolved, &second));
        assert_ne!(resolved.generation, first.generation);
    }

    #[tokio::test]
    async fn test_binding_unknown_chain_fails() {
        let registry = ChainRegistry::new(16);
        assert!(registry.bind(TenantId::new("acme"), None, ChainId::new("missing")).await.is_err());
    }
}
