use prometheus_client::registry::Registry;

/// Returns the sub registry all gateway metrics live under.
pub fn sub_registry(registry: &mut Registry) -> &mut Registry {
	registry.sub_registry_with_prefix("flowgate")
}
