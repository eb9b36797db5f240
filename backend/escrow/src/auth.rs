//! Axum extractors producing the authenticated caller of a signed request.

use axum::async_trait;
use axum::body::Bytes;
use axum::extract::{FromRef, FromRequest, FromRequestParts, Request};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use serde::de::DeserializeOwned;

use crate::address::Address;
use crate::errors::{EscrowError, Result};
use crate::signature::{SignatureAuth, HEADER_MSG, HEADER_PUB, HEADER_SIG};

/// The account that signed a body-less request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub address: Address,
}

/// A JSON body together with the account that signed it.
#[derive(Debug, Clone)]
pub struct Signed<T> {
    pub caller: Address,
    pub body: T,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| EscrowError::SignatureInvalid(format!("missing {name} header")))
}

fn authenticate(auth: &SignatureAuth, headers: &HeaderMap, body: &[u8]) -> Result<Address> {
    auth.verify(
        header(headers, HEADER_SIG)?,
        header(headers, HEADER_PUB)?,
        header(headers, HEADER_MSG)?,
        body,
    )
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    SignatureAuth: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = EscrowError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        let auth = SignatureAuth::from_ref(state);
        let address = authenticate(&auth, &parts.headers, &[])?;
        Ok(Caller { address })
    }
}

#[async_trait]
impl<S, T> FromRequest<S> for Signed<T>
where
    T: DeserializeOwned,
    SignatureAuth: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = EscrowError;

    async fn from_request(req: Request, state: &S) -> Result<Self> {
        let auth = SignatureAuth::from_ref(state);
        let headers = req.headers().clone();
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| EscrowError::Validation(e.body_text()))?;

        let caller = authenticate(&auth, &headers, &bytes)?;
        let body = serde_json::from_slice(&bytes)
            .map_err(|e| EscrowError::Validation(format!("invalid request body: {e}")))?;
        Ok(Signed { caller, body })
    }
}
