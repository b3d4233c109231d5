use std::sync::Arc;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;

use super::{FunctionPlugin, FunctionPluginParams, Plugin, UpstreamPlugin, UpstreamPluginParams};
use crate::errors::{Error, Result};
use crate::model::Upstream;
use crate::xds::proto::{set_filter_metadata, struct_from_pairs, struct_value};

const NAME: &str = "functional_processor";

/// Cluster metadata key holding the parsed spec of every function, by name.
pub const FUNCTIONS_METADATA_KEY: &str = "io.switchyard.functional_upstream";

/// Records each upstream function's parsed spec on its cluster. Registered
/// last so that every upstream plugin has already shaped the cluster.
pub struct FunctionalProcessor {
    function_plugins: Vec<Arc<dyn FunctionPlugin>>,
}

impl FunctionalProcessor {
    pub fn new(function_plugins: Vec<Arc<dyn FunctionPlugin>>) -> Self {
        Self { function_plugins }
    }
}

impl Plugin for FunctionalProcessor {
    fn name(&self) -> &'static str {
        NAME
    }

    fn upstream_plugin(self: Arc<Self>) -> Option<Arc<dyn UpstreamPlugin>> {
        Some(self)
    }
}

impl UpstreamPlugin for FunctionalProcessor {
    fn process_upstream(
        &self,
        _params: &UpstreamPluginParams,
        upstream: &Upstream,
        out: &mut Cluster,
    ) -> Result<()> {
        let params = FunctionPluginParams { upstream };
        let mut functions = Vec::new();
        for function in &upstream.functions {
            for plugin in &self.function_plugins {
                let parsed = plugin.parse_function_spec(&params, function).map_err(|e| {
                    Error::plugin(NAME, format!("parsing spec of function {}: {}", function.name, e))
                })?;
                if let Some(spec) = parsed {
                    functions.push((function.name.clone(), struct_value(spec)));
                    break;
                }
            }
        }
        if !functions.is_empty() {
            let metadata = struct_from_pairs([("functions", struct_value(struct_from_pairs(functions)))]);
            set_filter_metadata(&mut out.metadata, FUNCTIONS_METADATA_KEY, metadata);
        }
        Ok(())
    }
}
