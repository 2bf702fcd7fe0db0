//! The lws server-status JSON layout.

use micro_mux::{ConnStatsSnapshot, ContextSnapshot, MountSnapshot, VhostSnapshot};
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, Copy, Default)]
pub struct RenderOptions {
    /// Leave the per virtual host entries out, keeping only the totals.
    pub hide_vhosts: bool,
}

fn flag(value: bool) -> String {
    u8::from(value).to_string()
}

/// Counters in the order lws prints them for a virtual host.
fn counters(stats: &ConnStatsSnapshot, object: &mut Map<String, Value>) {
    for (name, value) in [
        ("rx", stats.rx),
        ("tx", stats.tx),
        ("h1_conn", stats.h1_conn),
        ("h1_trans", stats.h1_trans),
        ("h2_trans", stats.h2_trans),
        ("ws_upg", stats.ws_upg),
        ("rejected", stats.rejected),
        ("h2_upg", stats.h2_upg),
        ("h2_alpn", stats.h2_alpn),
        ("h2_subs", stats.h2_subs),
    ] {
        object.insert(name.to_string(), Value::String(value.to_string()));
    }
}

fn mount(mount: &MountSnapshot) -> Value {
    let mut object = Map::new();
    object.insert("mountpoint".to_string(), json!(mount.mountpoint));
    object.insert("origin".to_string(), json!(mount.origin));
    object.insert("cache_max_age".to_string(), json!(mount.cache_max_age.to_string()));
    object.insert("cache_reuse".to_string(), json!(flag(mount.cache_reuse)));
    object.insert("cache_revalidate".to_string(), json!(flag(mount.cache_revalidate)));
    object.insert("cache_intermediaries".to_string(), json!(flag(mount.cache_intermediaries)));
    if let Some(default) = &mount.default_document {
        object.insert("default".to_string(), json!(default));
    }
    Value::Object(object)
}

fn vhost(vhost: &VhostSnapshot) -> Value {
    let mut object = Map::new();
    object.insert("name".to_string(), json!(vhost.name));
    object.insert("port".to_string(), json!(vhost.bound_port.to_string()));
    object.insert("use_ssl".to_string(), json!(flag(vhost.tls)));
    object.insert("sts".to_string(), json!(flag(vhost.sts)));
    counters(&vhost.stats, &mut object);
    if !vhost.mounts.is_empty() {
        object.insert("mounts".to_string(), vhost.mounts.iter().map(mount).collect());
    }
    let protocols: Vec<Value> = vhost
        .protocols
        .iter()
        .map(|name| {
            let mut entry = Map::new();
            entry.insert(name.clone(), json!({ "status": "ok" }));
            Value::Object(entry)
        })
        .collect();
    object.insert("ws-protocols".to_string(), Value::Array(protocols));
    Value::Object(object)
}

/// Renders `snapshot` as the lws server-status document.
pub fn render(snapshot: &ContextSnapshot, options: RenderOptions) -> Value {
    let threads: Vec<Value> = snapshot
        .threads
        .iter()
        .map(|thread| {
            json!({
                "fds_count": thread.fds_count.to_string(),
                "ah_pool_inuse": thread.ah_pool_inuse.to_string(),
                "ah_wait_list": thread.ah_wait_list.to_string(),
            })
        })
        .collect();
    let vhosts: Vec<Value> = if options.hide_vhosts { Vec::new() } else { snapshot.vhosts.iter().map(vhost).collect() };

    let mut context = Map::new();
    context.insert("context_uptime".to_string(), json!(snapshot.uptime_secs.to_string()));
    context.insert("cgi_spawned".to_string(), json!(snapshot.cgi_spawned.to_string()));
    context.insert("pt_fd_max".to_string(), json!(snapshot.max_connections_per_thread.to_string()));
    context.insert("ah_pool_max".to_string(), json!(snapshot.header_pool_size.to_string()));
    context.insert("deprecated".to_string(), json!("0"));
    context.insert("wsi_alive".to_string(), json!(snapshot.live_connections.to_string()));
    context.insert("pt".to_string(), Value::Array(threads));
    context.insert("vhosts".to_string(), Value::Array(vhosts));
    context.insert("listen_wsi".to_string(), json!(snapshot.listening_vhosts.to_string()));
    counters(&snapshot.totals, &mut context);
    context.insert("cgi_alive".to_string(), json!(snapshot.cgi_alive.to_string()));

    let mut report = Map::new();
    report.insert("version".to_string(), json!(snapshot.version));
    report.insert("uptime".to_string(), json!(snapshot.uptime_secs.to_string()));
    if let Some(loads) = snapshot.load_average {
        for (n, load) in loads.iter().enumerate() {
            report.insert(format!("l{}", n + 1), json!(format!("{load:.2}")));
        }
    }
    report.insert("contexts".to_string(), json!([Value::Object(context)]));
    Value::Object(report)
}

pub fn render_string(snapshot: &ContextSnapshot, options: RenderOptions) -> String {
    render(snapshot, options).to_string()
}
