//! Caller identity attached to audited writes.

use std::{convert::Infallible, net::SocketAddr};

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{request::Parts, HeaderMap},
};
use data_model::{Actor, ANONYMOUS_ACTOR};

pub const ACTOR_HEADER: &str = "X-Actor";
pub const FORWARDED_FOR_HEADER: &str = "X-Forwarded-For";

/// The actor named by `X-Actor`, and the client address from the first
/// `X-Forwarded-For` hop or the peer socket.
#[derive(Debug, Clone)]
pub struct RequestActor(pub Actor);

impl RequestActor {
    pub fn into_inner(self) -> Actor {
        self.0
    }
}

impl<S> FromRequestParts<S> for RequestActor
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let name = header_string(&parts.headers, ACTOR_HEADER)
            .unwrap_or_else(|| ANONYMOUS_ACTOR.to_string());
        let source_ip = forwarded_for(&parts.headers).or_else(|| {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        });
        Ok(Self(Actor::new(name, source_ip)))
    }
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    let value = header_string(headers, FORWARDED_FOR_HEADER)?;
    value
        .split(',')
        .map(str::trim)
        .find(|hop| !hop.is_empty())
        .map(str::to_string)
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    let value = headers.get(name)?.to_str().ok()?.trim();
    (!value.is_empty()).then(|| value.to_string())
}
