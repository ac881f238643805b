//! The DNS-over-HTTPS listener (RFC 8484 plus the JSON convention).
//!
//! `/dns-query` accepts POST with `application/dns-message`, GET with a
//! base64url `dns` parameter, and GET/POST with
//! `Accept: application/dns-json` taking `name`/`type`/`do`/`cd`
//! parameters.  TLS termination is expected in front of this listener;
//! client addresses come from forwarding headers only when the proxy is
//! trusted by configuration.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

use sinkhole_wire::{Edns, Message, RData, RType, Record};

use crate::engine::Engine;
use crate::pipeline::{self, ClientInfo, TransportKind};
use crate::zone::render_rdata;

const CONTENT_TYPE_DNS: &str = "application/dns-message";
const CONTENT_TYPE_JSON: &str = "application/dns-json";

/// Run the DoH listener until the process exits.
pub async fn run(engine: Arc<Engine>) {
    let addr = engine.config.doh.listen;
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Could not bind DoH {addr}: {e}");
            return;
        }
    };
    engine.listeners.doh.store(true, Ordering::Relaxed);
    info!("DoH listener on {addr}");

    let app = Router::new()
        .route("/dns-query", get(handle_get).post(handle_post).options(preflight))
        .with_state(engine.clone());

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        error!("DoH server failed: {e}");
        engine.listeners.doh.store(false, Ordering::Relaxed);
    }
}

async fn preflight() -> Response {
    (StatusCode::NO_CONTENT, cors_headers()).into_response()
}

async fn handle_post(
    State(engine): State<Arc<Engine>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    body: axum::body::Bytes,
) -> Response {
    let client = client_ip(&engine, &headers, remote);

    if wants_json(&headers) {
        return json_query(&engine, client, &params).await;
    }
    if content_type(&headers) != Some(CONTENT_TYPE_DNS) {
        return (StatusCode::UNSUPPORTED_MEDIA_TYPE, cors_headers()).into_response();
    }
    binary_query(&engine, client, &body).await
}

async fn handle_get(
    State(engine): State<Arc<Engine>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let client = client_ip(&engine, &headers, remote);

    if let Some(dns) = params.get("dns") {
        let Ok(wire) = URL_SAFE_NO_PAD.decode(dns.trim_end_matches('=')) else {
            return (StatusCode::BAD_REQUEST, cors_headers()).into_response();
        };
        return binary_query(&engine, client, &wire).await;
    }

    if wants_json(&headers) || params.contains_key("name") {
        return json_query(&engine, client, &params).await;
    }

    (StatusCode::BAD_REQUEST, cors_headers()).into_response()
}

//----------- Binary mode ------------------------------------------------------

async fn binary_query(engine: &Arc<Engine>, client: IpAddr, wire: &[u8]) -> Response {
    let info = ClientInfo {
        addr: client,
        transport: TransportKind::Doh,
    };
    match pipeline::handle(engine, wire, info).await {
        Some(response) => {
            let mut headers = cors_headers();
            headers.insert(
                header::CONTENT_TYPE,
                CONTENT_TYPE_DNS.parse().unwrap(),
            );
            (StatusCode::OK, headers, response).into_response()
        }
        None => (StatusCode::BAD_REQUEST, cors_headers()).into_response(),
    }
}

//----------- JSON mode --------------------------------------------------------

#[derive(Serialize)]
struct JsonResponse {
    #[serde(rename = "Status")]
    status: u8,
    #[serde(rename = "TC")]
    tc: bool,
    #[serde(rename = "RD")]
    rd: bool,
    #[serde(rename = "RA")]
    ra: bool,
    #[serde(rename = "AD")]
    ad: bool,
    #[serde(rename = "CD")]
    cd: bool,
    #[serde(rename = "Question")]
    question: Vec<JsonQuestion>,
    #[serde(rename = "Answer", skip_serializing_if = "Vec::is_empty")]
    answer: Vec<JsonRecord>,
    #[serde(rename = "Authority", skip_serializing_if = "Vec::is_empty")]
    authority: Vec<JsonRecord>,
}

#[derive(Serialize)]
struct JsonQuestion {
    name: String,
    #[serde(rename = "type")]
    rtype: u16,
}

#[derive(Serialize)]
struct JsonRecord {
    name: String,
    #[serde(rename = "type")]
    rtype: u16,
    #[serde(rename = "TTL")]
    ttl: u32,
    data: String,
}

async fn json_query(
    engine: &Arc<Engine>,
    client: IpAddr,
    params: &HashMap<String, String>,
) -> Response {
    let Some(name) = params.get("name") else {
        return (StatusCode::BAD_REQUEST, cors_headers()).into_response();
    };
    let Ok(qname) = name.parse::<sinkhole_wire::Name>() else {
        return (StatusCode::BAD_REQUEST, cors_headers()).into_response();
    };

    // `type` accepts a mnemonic or a number; default A.
    let qtype = match params.get("type") {
        None => RType::A,
        Some(t) => match t.parse::<u16>() {
            Ok(n) => RType::from(n),
            Err(_) => match t.parse::<RType>() {
                Ok(rtype) => rtype,
                Err(_) => return (StatusCode::BAD_REQUEST, cors_headers()).into_response(),
            },
        },
    };
    let do_bit = params.get("do").map(|v| flag(v)).unwrap_or(false);
    let cd_bit = params.get("cd").map(|v| flag(v)).unwrap_or(false);

    let mut query = Message::query(0, qname, qtype);
    query.header.flags.cd = cd_bit;
    let mut edns = Edns::new(4096);
    edns.set_do_bit(do_bit);
    query.additionals.push(Record::opt(edns));

    let info = ClientInfo {
        addr: client,
        transport: TransportKind::Doh,
    };
    let Some(wire) = pipeline::handle(engine, &query.encode(), info).await else {
        return (StatusCode::BAD_REQUEST, cors_headers()).into_response();
    };
    let Ok(response) = Message::decode(&wire) else {
        return (StatusCode::INTERNAL_SERVER_ERROR, cors_headers()).into_response();
    };

    let json = JsonResponse {
        status: u8::from(response.header.rcode),
        tc: response.header.flags.tc,
        rd: response.header.flags.rd,
        ra: response.header.flags.ra,
        ad: response.header.flags.ad,
        cd: response.header.flags.cd,
        question: response
            .questions
            .iter()
            .map(|q| JsonQuestion {
                name: q.qname.to_string(),
                rtype: q.qtype.into(),
            })
            .collect(),
        answer: response.answers.iter().map(json_record).collect(),
        authority: response.authorities.iter().map(json_record).collect(),
    };

    let mut headers = cors_headers();
    headers.insert(header::CONTENT_TYPE, CONTENT_TYPE_JSON.parse().unwrap());
    (
        StatusCode::OK,
        headers,
        serde_json::to_vec(&json).unwrap_or_default(),
    )
        .into_response()
}

fn json_record(record: &Record) -> JsonRecord {
    JsonRecord {
        name: record.name.to_string(),
        rtype: record.rtype().into(),
        ttl: record.ttl,
        data: presentation_data(&record.data),
    }
}

/// The `data` field of a JSON answer; types without a presentation form
/// fall back to base64 of the raw rdata.
fn presentation_data(data: &RData) -> String {
    if let Some(text) = render_rdata(data) {
        return text;
    }
    match data {
        RData::Soa {
            mname,
            rname,
            serial,
            refresh,
            retry,
            expire,
            minimum,
        } => {
            format!("{mname} {rname} {serial} {refresh} {retry} {expire} {minimum}")
        }
        other => base64::engine::general_purpose::STANDARD.encode(other.canonical_bytes()),
    }
}

fn flag(value: &str) -> bool {
    matches!(value, "1" | "true")
}

//----------- Header plumbing --------------------------------------------------

fn cors_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CACHE_CONTROL,
        "no-cache, no-store, must-revalidate".parse().unwrap(),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        "*".parse().unwrap(),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        "GET, POST, OPTIONS".parse().unwrap(),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        "content-type, accept".parse().unwrap(),
    );
    headers
}

fn wants_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains(CONTENT_TYPE_JSON))
        .unwrap_or(false)
}

fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.split(';').next().unwrap_or(ct).trim())
}

/// The client address: forwarding headers first when the proxy is
/// trusted, then the TCP peer.
fn client_ip(engine: &Arc<Engine>, headers: &HeaderMap, remote: SocketAddr) -> IpAddr {
    if !engine.config.doh.trust_proxy_headers {
        return remote.ip();
    }

    let header_ip = |name: &str| -> Option<IpAddr> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok())
    };

    header_ip("x-forwarded-for")
        .or_else(|| header_ip("x-real-ip"))
        .or_else(|| header_ip("cf-connecting-ip"))
        .unwrap_or_else(|| remote.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_include;
    use serde_json::json;

    #[test]
    fn json_shape_matches_the_convention() {
        let qname: sinkhole_wire::Name = "example.com".parse().unwrap();
        let query = Message::query(0, qname.clone(), RType::A);
        let mut response = Message::reply_to(&query);
        response.answers.push(Record::new(
            qname,
            300,
            RData::A("192.0.2.1".parse().unwrap()),
        ));

        let json = JsonResponse {
            status: u8::from(response.header.rcode),
            tc: false,
            rd: true,
            ra: true,
            ad: false,
            cd: false,
            question: response
                .questions
                .iter()
                .map(|q| JsonQuestion {
                    name: q.qname.to_string(),
                    rtype: q.qtype.into(),
                })
                .collect(),
            answer: response.answers.iter().map(json_record).collect(),
            authority: vec![],
        };

        let value = serde_json::to_value(&json).unwrap();
        assert_json_include!(
            actual: value,
            expected: json!({
                "Status": 0,
                "Question": [{"name": "example.com.", "type": 1}],
                "Answer": [{"name": "example.com.", "type": 1, "TTL": 300, "data": "192.0.2.1"}],
            })
        );
    }

    #[test]
    fn forwarding_headers_take_the_first_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "203.0.113.7, 10.0.0.1".parse().unwrap(),
        );
        let remote: SocketAddr = "127.0.0.1:443".parse().unwrap();

        let engine = {
            let mut config = crate::config::Config::default();
            config.doh.trust_proxy_headers = true;
            crate::engine::Engine::new(
                config,
                crate::store::Store::in_memory(Default::default()),
            )
        };
        assert_eq!(
            client_ip(&engine, &headers, remote),
            "203.0.113.7".parse::<IpAddr>().unwrap()
        );

        // Headers are ignored unless the proxy is trusted.
        let untrusted = crate::engine::Engine::new(
            crate::config::Config::default(),
            crate::store::Store::in_memory(Default::default()),
        );
        assert_eq!(
            client_ip(&untrusted, &headers, remote),
            "127.0.0.1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn aaaa_presentation_is_canonical() {
        let data = RData::Aaaa("2001:db8:0:0:0:0:0:1".parse().unwrap());
        assert_eq!(presentation_data(&data), "2001:db8::1");
    }
}
