//! TLS filter chains, filter plugins and the final listener.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use envoy_types::pb::envoy::config::core::v3::{transport_socket, TransportSocket};
use envoy_types::pb::envoy::config::listener::v3::{
    listener_filter, FilterChain, FilterChainMatch, Listener as EnvoyListener, ListenerFilter,
};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager::RouteSpecifier, HttpFilter, Rds,
};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    common_tls_context, CertificateValidationContext, CommonTlsContext, DownstreamTlsContext,
    TlsCertificate,
};
use envoy_types::pb::google::protobuf::Any;
use tracing::warn;

use super::Reports;
use crate::errors::{Error, Result};
use crate::model::{Files, Listener, ObjectRef, SecretMap, SslConfig, SslSource, VirtualService};
use crate::plugins::{ListenerPluginParams, PluginRegistry};
use crate::xds::proto::{
    ads_config_source, any_from_message, http_connection_manager_filter, inline_string,
    socket_address,
};
use crate::xds::{
    DOWNSTREAM_TLS_TYPE_URL, TLS_INSPECTOR_FILTER, TLS_INSPECTOR_TYPE_URL, TLS_TRANSPORT_SOCKET,
};

/// Keys read from an SSL secret.
pub const SSL_CERT_CHAIN_KEY: &str = "ca_chain";
pub const SSL_PRIVATE_KEY_KEY: &str = "private_key";
pub const SSL_ROOT_CA_KEY: &str = "root_ca";

const TLS_TRANSPORT_PROTOCOL: &str = "tls";

/// Certificate material for one filter chain, as PEM text.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct ResolvedSsl {
    pub chain_key: String,
    pub cert_chain: String,
    pub private_key: String,
    pub root_ca: Option<String>,
}

pub(super) fn resolve_ssl(ssl: &SslConfig, secrets: &SecretMap, files: &Files) -> Result<ResolvedSsl> {
    let chain_key = ssl.source.chain_key();
    match &ssl.source {
        SslSource::SecretRef(name) => {
            let secret = secrets.get(name).ok_or_else(|| {
                Error::validation(format!("ssl secret not found for ref {}", name))
            })?;
            let required = |key: &str| {
                secret.get(key).map(str::to_string).ok_or_else(|| {
                    Error::validation(format!("key {} not found in ssl secrets", key))
                })
            };
            Ok(ResolvedSsl {
                chain_key,
                cert_chain: required(SSL_CERT_CHAIN_KEY)?,
                private_key: required(SSL_PRIVATE_KEY_KEY)?,
                root_ca: secret.get(SSL_ROOT_CA_KEY).map(str::to_string),
            })
        }
        SslSource::SslFiles(refs) => {
            let read = |file_ref: &str| -> Result<String> {
                let contents = files.get(file_ref).ok_or_else(|| {
                    Error::validation(format!("ssl file not found for ref {}", file_ref))
                })?;
                contents.as_utf8().map(str::to_string).ok_or_else(|| {
                    Error::validation(format!("ssl file {} is not valid UTF-8", file_ref))
                })
            };
            Ok(ResolvedSsl {
                chain_key,
                cert_chain: read(&refs.tls_cert)?,
                private_key: read(&refs.tls_key)?,
                root_ca: refs.root_ca.as_deref().map(read).transpose()?,
            })
        }
    }
}

/// One TLS filter chain and the SNI names it matches.
#[derive(Debug, Clone)]
pub(super) struct SslChain {
    pub ssl: ResolvedSsl,
    pub server_names: Vec<String>,
}

/// How a listener's virtual services split into filter chains.
#[derive(Debug, Default)]
pub(super) struct ChainPlan<'a> {
    /// Virtual services that survived SSL resolution, with whether they
    /// require TLS.
    pub virtual_services: Vec<(&'a VirtualService, bool)>,
    pub ssl_chains: Vec<SslChain>,
    pub insecure: bool,
}

/// Group virtual services by certificate. Virtual services whose SSL config
/// cannot be resolved are dropped and reported.
pub(super) fn plan_filter_chains<'a>(
    virtual_services: &[&'a VirtualService],
    secrets: &SecretMap,
    files: &Files,
    reports: &mut Reports,
) -> ChainPlan<'a> {
    let mut plan = ChainPlan::default();
    // SNI name to the chain key of the certificate serving it.
    let mut owners: HashMap<String, String> = HashMap::new();
    let mut catch_all: Option<String> = None;

    for &vs in virtual_services {
        let Some(ssl_config) = &vs.ssl_config else {
            plan.insecure = true;
            plan.virtual_services.push((vs, false));
            continue;
        };

        let ssl = match resolve_ssl(ssl_config, secrets, files) {
            Ok(ssl) => ssl,
            Err(e) => {
                warn!(virtual_service = %vs.name, error = %e, "Dropping virtual service with unresolved SSL config");
                reports.add(ObjectRef::virtual_service(&vs.name), e);
                continue;
            }
        };

        let names: Vec<String> = if ssl_config.sni_domains.is_empty() {
            vs.effective_domains().into_iter().filter(|d| d != "*").collect()
        } else {
            ssl_config.sni_domains.clone()
        };

        // A chain without server names matches every TLS connection, so
        // only one certificate may own it.
        let conflict = if names.is_empty() {
            catch_all
                .as_ref()
                .filter(|key| **key != ssl.chain_key)
                .map(|_| "a catch-all TLS filter chain already uses another certificate".to_string())
        } else if names.iter().all(|n| owners.get(n).is_some_and(|key| *key != ssl.chain_key)) {
            Some(format!("SNI domains [{}] are already served by another certificate", names.join(", ")))
        } else {
            None
        };
        if let Some(message) = conflict {
            warn!(virtual_service = %vs.name, error = %message, "Dropping virtual service with conflicting SNI domains");
            reports.add(ObjectRef::virtual_service(&vs.name), Error::validation(message));
            continue;
        }
        if names.is_empty() {
            catch_all = Some(ssl.chain_key.clone());
        }
        plan.virtual_services.push((vs, true));

        let chain_key = ssl.chain_key.clone();
        let index = match plan.ssl_chains.iter().position(|c| c.ssl.chain_key == chain_key) {
            Some(index) => index,
            None => {
                plan.ssl_chains.push(SslChain { ssl, server_names: Vec::new() });
                plan.ssl_chains.len() - 1
            }
        };
        for name in names {
            if let Entry::Vacant(owner) = owners.entry(name.clone()) {
                owner.insert(chain_key.clone());
                plan.ssl_chains[index].server_names.push(name);
            }
        }
    }
    plan
}

fn downstream_tls(ssl: &ResolvedSsl) -> TransportSocket {
    let validation_context_type = ssl.root_ca.as_ref().map(|ca| {
        common_tls_context::ValidationContextType::ValidationContext(CertificateValidationContext {
            trusted_ca: Some(inline_string(ca.as_str())),
            ..Default::default()
        })
    });
    let context = DownstreamTlsContext {
        common_tls_context: Some(CommonTlsContext {
            tls_certificates: vec![TlsCertificate {
                certificate_chain: Some(inline_string(ssl.cert_chain.as_str())),
                private_key: Some(inline_string(ssl.private_key.as_str())),
                ..Default::default()
            }],
            validation_context_type,
            ..Default::default()
        }),
        ..Default::default()
    };
    TransportSocket {
        name: TLS_TRANSPORT_SOCKET.to_string(),
        config_type: Some(transport_socket::ConfigType::TypedConfig(any_from_message(
            DOWNSTREAM_TLS_TYPE_URL,
            &context,
        ))),
    }
}

fn tls_inspector() -> ListenerFilter {
    ListenerFilter {
        name: TLS_INSPECTOR_FILTER.to_string(),
        config_type: Some(listener_filter::ConfigType::TypedConfig(Any {
            type_url: TLS_INSPECTOR_TYPE_URL.to_string(),
            value: Vec::new(),
        })),
        ..Default::default()
    }
}

/// HTTP and listener filters contributed by plugins, each list sorted by
/// stage then name. A failing plugin contributes nothing and is reported
/// on the role.
pub(super) fn plugin_filters(
    registry: &PluginRegistry,
    params: &ListenerPluginParams<'_>,
    reports: &mut Reports,
) -> (Vec<HttpFilter>, Vec<ListenerFilter>) {
    let role = ObjectRef::role(&params.role.name);

    let mut http = Vec::new();
    for registered in registry.http_filter_plugins() {
        match registered.capability.http_filters(params) {
            Ok(filters) => http.extend(filters),
            Err(e) => reports.add(role.clone(), e),
        }
    }
    http.sort_by(|a, b| (a.stage, &a.filter.name).cmp(&(b.stage, &b.filter.name)));

    let mut listener = Vec::new();
    for registered in registry.listener_filter_plugins() {
        match registered.capability.listener_filters(params) {
            Ok(filters) => listener.extend(filters),
            Err(e) => reports.add(role.clone(), e),
        }
    }
    listener.sort_by(|a, b| (a.stage, &a.filter.name).cmp(&(b.stage, &b.filter.name)));

    (
        http.into_iter().map(|staged| staged.filter).collect(),
        listener.into_iter().map(|staged| staged.filter).collect(),
    )
}

/// The Envoy listener: one TLS chain per certificate, then a plaintext
/// chain when any virtual service does not use TLS. All chains share one
/// HTTP connection manager fetching `route_config_name` over ADS.
pub(super) fn envoy_listener(
    listener: &Listener,
    route_config_name: String,
    plan: &ChainPlan<'_>,
    http_filters: Vec<HttpFilter>,
    plugin_listener_filters: Vec<ListenerFilter>,
) -> EnvoyListener {
    let hcm = http_connection_manager_filter(
        &listener.name,
        RouteSpecifier::Rds(Rds {
            config_source: Some(ads_config_source()),
            route_config_name,
        }),
        http_filters,
    );

    let mut filter_chains: Vec<FilterChain> = plan
        .ssl_chains
        .iter()
        .map(|chain| FilterChain {
            filter_chain_match: Some(FilterChainMatch {
                server_names: chain.server_names.clone(),
                transport_protocol: TLS_TRANSPORT_PROTOCOL.to_string(),
                ..Default::default()
            }),
            filters: vec![hcm.clone()],
            transport_socket: Some(downstream_tls(&chain.ssl)),
            ..Default::default()
        })
        .collect();
    if plan.insecure {
        filter_chains.push(FilterChain { filters: vec![hcm], ..Default::default() });
    }

    let mut listener_filters = Vec::with_capacity(plugin_listener_filters.len() + 1);
    if !plan.ssl_chains.is_empty() {
        listener_filters.push(tls_inspector());
    }
    listener_filters.extend(plugin_listener_filters);

    EnvoyListener {
        name: listener.name.clone(),
        address: Some(socket_address(&listener.bind_address, listener.bind_port)),
        filter_chains,
        listener_filters,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Config, FileContents, Role, Secret, SslFiles};
    use std::collections::BTreeMap;

    fn secret(pairs: &[(&str, &str)]) -> Secret {
        Secret { data: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect() }
    }

    fn tls_vs(name: &str, domains: &[&str], secret_ref: &str) -> VirtualService {
        VirtualService {
            name: name.into(),
            domains: domains.iter().map(|d| d.to_string()).collect(),
            ssl_config: Some(SslConfig {
                source: SslSource::SecretRef(secret_ref.into()),
                sni_domains: Vec::new(),
            }),
            ..Default::default()
        }
    }

    fn reports() -> Reports {
        Reports::new(&Config::default(), &Role { name: "ingress".into(), ..Default::default() })
    }

    #[test]
    fn secret_keys_are_required() {
        let ssl = SslConfig { source: SslSource::SecretRef("cert".into()), sni_domains: vec![] };

        let err = resolve_ssl(&ssl, &SecretMap::new(), &Files::new()).unwrap_err();
        assert!(err.to_string().contains("ssl secret not found for ref cert"));

        let secrets = SecretMap::from([("cert".to_string(), secret(&[(SSL_CERT_CHAIN_KEY, "chain")]))]);
        let err = resolve_ssl(&ssl, &secrets, &Files::new()).unwrap_err();
        assert!(err.to_string().contains("key private_key not found in ssl secrets"));
    }

    #[test]
    fn ssl_files_are_read_as_text() {
        let ssl = SslConfig {
            source: SslSource::SslFiles(SslFiles {
                tls_cert: "cert.pem".into(),
                tls_key: "key.pem".into(),
                root_ca: Some("ca.pem".into()),
            }),
            sni_domains: vec![],
        };
        let files = Files::from([
            ("cert.pem".to_string(), FileContents { contents: b"CERT".to_vec() }),
            ("key.pem".to_string(), FileContents { contents: b"KEY".to_vec() }),
            ("ca.pem".to_string(), FileContents { contents: b"CA".to_vec() }),
        ]);

        let resolved = resolve_ssl(&ssl, &SecretMap::new(), &files).expect("resolved");
        assert_eq!(resolved.cert_chain, "CERT");
        assert_eq!(resolved.root_ca.as_deref(), Some("CA"));
    }

    #[test]
    fn virtual_services_sharing_a_certificate_share_a_chain() {
        let secrets = SecretMap::from([(
            "cert".to_string(),
            secret(&[(SSL_CERT_CHAIN_KEY, "chain"), (SSL_PRIVATE_KEY_KEY, "key")]),
        )]);
        let a = tls_vs("vs-a", &["a.com"], "cert");
        let b = tls_vs("vs-b", &["b.com", "*"], "cert");
        let plain = VirtualService { name: "vs-plain".into(), ..Default::default() };
        let broken = tls_vs("vs-broken", &["c.com"], "missing");
        let mut reports = reports();

        let plan = plan_filter_chains(&[&a, &b, &plain, &broken], &secrets, &Files::new(), &mut reports);

        assert_eq!(plan.ssl_chains.len(), 1);
        assert_eq!(plan.ssl_chains[0].server_names, vec!["a.com".to_string(), "b.com".to_string()]);
        assert!(plan.insecure);
        let kept: Vec<_> = plan.virtual_services.iter().map(|(vs, tls)| (vs.name.as_str(), *tls)).collect();
        assert_eq!(kept, vec![("vs-a", true), ("vs-b", true), ("vs-plain", false)]);
        assert!(reports
            .error_text(&ObjectRef::virtual_service("vs-broken"))
            .contains("ssl secret not found for ref missing"));
    }

    #[test]
    fn sni_domains_owned_by_another_certificate_drop_the_virtual_service() {
        let secrets = SecretMap::from([
            ("cert".to_string(), secret(&[(SSL_CERT_CHAIN_KEY, "chain"), (SSL_PRIVATE_KEY_KEY, "key")])),
            ("other".to_string(), secret(&[(SSL_CERT_CHAIN_KEY, "chain2"), (SSL_PRIVATE_KEY_KEY, "key2")])),
        ]);
        let a = tls_vs("vs-a", &["a.com"], "cert");
        let shadowed = tls_vs("vs-shadowed", &["a.com"], "other");
        let wildcard = tls_vs("vs-wildcard", &["*"], "cert");
        let second_wildcard = tls_vs("vs-second-wildcard", &["*"], "other");
        let mut reports = reports();

        let plan = plan_filter_chains(
            &[&a, &shadowed, &wildcard, &second_wildcard],
            &secrets,
            &Files::new(),
            &mut reports,
        );

        assert_eq!(plan.ssl_chains.len(), 1);
        assert_eq!(plan.ssl_chains[0].ssl.chain_key, a.ssl_config.as_ref().expect("ssl").source.chain_key());
        let kept: Vec<_> = plan.virtual_services.iter().map(|(vs, _)| vs.name.as_str()).collect();
        assert_eq!(kept, vec!["vs-a", "vs-wildcard"]);
        assert!(reports
            .error_text(&ObjectRef::virtual_service("vs-shadowed"))
            .contains("already served by another certificate"));
        assert!(reports
            .error_text(&ObjectRef::virtual_service("vs-second-wildcard"))
            .contains("catch-all TLS filter chain"));
    }

    #[test]
    fn tls_chains_come_before_the_plaintext_chain() {
        let plan = ChainPlan {
            virtual_services: Vec::new(),
            ssl_chains: vec![SslChain {
                ssl: ResolvedSsl {
                    chain_key: "secret:cert".into(),
                    cert_chain: "chain".into(),
                    private_key: "key".into(),
                    root_ca: None,
                },
                server_names: vec!["a.com".into()],
            }],
            insecure: true,
        };
        let listener = Listener {
            name: "http".into(),
            bind_address: "0.0.0.0".into(),
            bind_port: 8443,
            virtual_services: vec![],
            attributes: vec![],
            extensions: BTreeMap::new(),
        };

        let out = envoy_listener(&listener, "http-routes".into(), &plan, Vec::new(), Vec::new());

        assert_eq!(out.filter_chains.len(), 2);
        let tls_match = out.filter_chains[0].filter_chain_match.as_ref().expect("match");
        assert_eq!(tls_match.server_names, vec!["a.com".to_string()]);
        assert_eq!(tls_match.transport_protocol, "tls");
        assert!(out.filter_chains[0].transport_socket.is_some());
        assert!(out.filter_chains[1].transport_socket.is_none());
        assert_eq!(out.listener_filters[0].name, TLS_INSPECTOR_FILTER);
    }
}
