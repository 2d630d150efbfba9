use webrtc::ice::mdns::MulticastDnsMode;

/// Environment variable selecting the ICE mDNS mode
pub const MDNS_MODE_ENV: &str = "QRCAST_WEBRTC_MDNS_MODE";

pub fn parse_mdns_mode(raw: &str) -> Option<MulticastDnsMode> {
    let value = raw.trim().to_ascii_lowercase();
    match value.as_str() {
        "disabled" | "off" | "false" | "0" => Some(MulticastDnsMode::Disabled),
        "query" | "query_only" | "query-only" => Some(MulticastDnsMode::QueryOnly),
        "gather" | "query_and_gather" | "query-and-gather" | "on" | "true" | "1" => {
            Some(MulticastDnsMode::QueryAndGather)
        }
        _ => None,
    }
}

pub fn mdns_mode_from_env() -> Option<MulticastDnsMode> {
    parse_mdns_mode(&std::env::var(MDNS_MODE_ENV).ok()?)
}

pub fn mdns_mode() -> MulticastDnsMode {
    // QueryOnly keeps raw host addresses in the offer; the answering peer on
    // the same LAN can reach them without resolving .local names.
    mdns_mode_from_env().unwrap_or(MulticastDnsMode::QueryOnly)
}

pub fn mdns_mode_label(mode: MulticastDnsMode) -> &'static str {
    match mode {
        MulticastDnsMode::Disabled => "disabled",
        MulticastDnsMode::QueryOnly => "query_only",
        MulticastDnsMode::QueryAndGather => "query_and_gather",
    }
}

pub fn default_mdns_host_name(engine_id: &str) -> String {
    format!("{engine_id}.local")
}
