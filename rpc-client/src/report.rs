use crate::client::ClientSet;

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

/// Breaker and pool state of every client as Prometheus-style text.
pub fn render_text(clients: &ClientSet) -> String {
    let mut buf = String::new();
    for (name, client) in clients.iter() {
        let service = escape(name);
        for m in client.breaker_metrics() {
            let labels = format!(
                "service=\"{}\",cluster=\"{}\",method=\"{}\"",
                service, escape(&m.to_cluster), escape(&m.method)
            );
            buf.push_str(&format!("rpc_breaker_state{{{},state=\"{}\"}} 1\n", labels, m.state.as_str()));
            buf.push_str(&format!("rpc_breaker_concurrency{{{}}} {}\n", labels, m.concurrency));
            buf.push_str(&format!("rpc_breaker_successes{{{}}} {}\n", labels, m.successes));
            buf.push_str(&format!("rpc_breaker_failures{{{}}} {}\n", labels, m.failures));
            buf.push_str(&format!("rpc_breaker_timeouts{{{}}} {}\n", labels, m.timeouts));
            buf.push_str(&format!("rpc_breaker_error_rate{{{}}} {}\n", labels, m.error_rate));
        }
        for (addr, state) in client.instance_breakers() {
            buf.push_str(&format!(
                "rpc_instance_breaker_state{{service=\"{}\",addr=\"{}\",state=\"{}\"}} 1\n",
                service, escape(&addr), state.as_str()
            ));
        }
        for (addr, idle) in client.idle_connections() {
            buf.push_str(&format!(
                "rpc_pool_idle{{service=\"{}\",addr=\"{}\"}} {}\n",
                service, escape(&addr), idle
            ));
        }
    }
    buf
}
