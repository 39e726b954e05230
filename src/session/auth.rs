//! Authentication state machine.
//!
//! ```text
//! Initial ──negotiate──► Negotiated ──┬── legacy response ─────────────┬──► Authenticated
//!                                     │                                │
//!                                     └─ NegotiateBlob ─► ChallengeReceived
//!                                                          └─ AuthenticateBlob
//!                         any explicit rejection ───────────────────────────► Failed
//! ```
//!
//! Negotiation happens once per transport generation and is shared by every
//! session on it. Which response path runs depends on the negotiated
//! capabilities: without extended security the legacy response goes inline
//! in a single session setup; with it, the blob exchange runs and upgrades
//! to the keyed response when both sides allow it.

use std::sync::Arc;

use bytes::Bytes;

use super::{rejection, Session, SessionSigner};
use crate::crypto::{
    identity_key, keyed_response, legacy_response, random_challenge, random_guid, signing_key,
};
use crate::error::{CifsError, Result};
use crate::protocol::{
    blob_flags, AuthenticateBlob, Capabilities, ChallengeBlob, Command, Frame, Header,
    NegotiateBlob, NegotiateRequest, NegotiateResponse, SessionSetupRequest, SessionSetupResponse,
    Status, CHALLENGE_SIZE,
};
use crate::transport::{Negotiation, Transport};

/// Where a session is in its authentication exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Nothing sent yet for this incarnation
    Initial,
    /// Capabilities known
    Negotiated,
    /// Server challenge blob received
    ChallengeReceived,
    /// Session usable
    Authenticated,
    /// Server rejected the credentials (terminal)
    Failed,
}

/// What a successful exchange established
struct Established {
    session_id: u64,
    server_challenge: [u8; CHALLENGE_SIZE],
}

/// Run the full state machine for `session` on its transport's current
/// stream.
pub(super) async fn authenticate(session: &Arc<Session>) -> Result<()> {
    let transport = session.transport();
    let generation = transport.generation();
    session.set_auth_state(AuthState::Initial);

    let outcome = run(session, transport).await;
    match outcome {
        Ok((negotiation, established)) => {
            let key = signing_key(&session.secret, &established.server_challenge)?;
            let signer = if negotiation.caps.signing {
                Some(Arc::new(SessionSigner::new(&key)?))
            } else {
                None
            };
            session.establish(
                generation,
                established.session_id,
                negotiation.caps,
                key,
                signer,
            )?;
            tracing::info!(
                identity = %session.identity,
                session_id = established.session_id,
                signing = session.is_signing(),
                "Session authenticated"
            );
            Ok(())
        }
        Err(e @ CifsError::Authentication { .. }) => {
            session.fail();
            tracing::warn!(identity = %session.identity, error = %e, "Authentication failed");
            Err(e)
        }
        Err(e) => {
            tracing::debug!(identity = %session.identity, error = %e, "Authentication interrupted");
            Err(e)
        }
    }
}

async fn run(
    session: &Arc<Session>,
    transport: &Arc<Transport>,
) -> Result<(Negotiation, Established)> {
    let negotiation = negotiate(transport, &session.offer).await?;
    session.set_auth_state(AuthState::Negotiated);

    let established = if negotiation.caps.extended_security() {
        blob_exchange(session, &negotiation).await?
    } else {
        legacy_exchange(session, &negotiation).await?
    };
    Ok((negotiation, established))
}

/// Negotiate capabilities unless this generation already has.
async fn negotiate(
    transport: &Arc<Transport>,
    offer: &Capabilities,
) -> Result<Negotiation> {
    if let Some(negotiation) = transport.negotiation() {
        return Ok(negotiation);
    }
    let _guard = transport.negotiate_guard().await;
    if let Some(negotiation) = transport.negotiation() {
        return Ok(negotiation);
    }

    let generation = transport.generation();
    let request = NegotiateRequest {
        capabilities: offer.clone(),
        client_guid: random_guid(),
    };
    let response = transport
        .request(Frame::new(Header::request(Command::Negotiate), request.encode()))
        .await?;
    if !response.header.status.is_success() {
        return Err(rejection(Command::Negotiate, response.header.status));
    }

    let reply = NegotiateResponse::decode(response.payload)?;
    let caps = offer
        .negotiate(&reply.capabilities())
        .ok_or_else(|| CifsError::Authentication {
            status: None,
            message: format!(
                "No acceptable dialect or signing policy (server chose 0x{:04X})",
                reply.dialect
            ),
        })?;

    let negotiation = Negotiation {
        caps,
        challenge: reply.challenge,
        server_guid: reply.server_guid,
    };
    transport.set_negotiation(generation, negotiation.clone())?;
    Ok(negotiation)
}

async fn session_setup(
    transport: &Arc<Transport>,
    session_id: u64,
    request: SessionSetupRequest,
) -> Result<Frame> {
    let mut header = Header::request(Command::SessionSetup);
    header.session_id = session_id;
    transport
        .request(Frame::new(header, request.encode()))
        .await
}

async fn legacy_exchange(session: &Arc<Session>, negotiation: &Negotiation) -> Result<Established> {
    let response = legacy_response(&session.secret, &negotiation.challenge);
    let request = SessionSetupRequest::Legacy {
        username: session.identity.username.clone(),
        domain: session.identity.domain.clone(),
        response: Bytes::copy_from_slice(&response),
    };

    let reply = session_setup(session.transport(), 0, request).await?;
    if reply.header.status != Status::Success {
        return Err(rejection(Command::SessionSetup, reply.header.status));
    }
    let setup = SessionSetupResponse::decode(reply.payload)?;
    if setup.guest {
        tracing::warn!(identity = %session.identity, "Server granted guest access");
    }

    Ok(Established {
        session_id: reply.header.session_id,
        server_challenge: negotiation.challenge,
    })
}

async fn blob_exchange(session: &Arc<Session>, negotiation: &Negotiation) -> Result<Established> {
    let transport = session.transport();
    let want_keyed = negotiation.caps.keyed_response();

    let mut flags = blob_flags::IDENTITY;
    if want_keyed {
        flags |= blob_flags::KEYED;
    }
    let hello = NegotiateBlob {
        flags,
        workstation: session.workstation.clone(),
        domain: session.identity.domain.clone(),
    };

    let first = session_setup(transport, 0, SessionSetupRequest::Blob(hello.encode())).await?;
    if first.header.status != Status::MoreProcessingRequired {
        return Err(rejection(Command::SessionSetup, first.header.status));
    }
    let session_id = first.header.session_id;
    let challenge = ChallengeBlob::decode(SessionSetupResponse::decode(first.payload)?.blob)?;
    session.set_auth_state(AuthState::ChallengeReceived);

    let server_challenge = challenge.server_challenge;
    let (flags, response, client_challenge) = if want_keyed && challenge.keyed() {
        let client_challenge = random_challenge();
        let key = identity_key(
            &session.secret,
            &session.identity.username,
            &session.identity.domain,
        )?;
        let response = keyed_response(&key, &server_challenge, &client_challenge)?;
        (blob_flags::KEYED | blob_flags::IDENTITY, response, client_challenge)
    } else {
        (
            blob_flags::IDENTITY,
            legacy_response(&session.secret, &server_challenge),
            [0u8; CHALLENGE_SIZE],
        )
    };

    let authenticate = AuthenticateBlob {
        flags,
        response: Bytes::copy_from_slice(&response),
        client_challenge,
        domain: session.identity.domain.clone(),
        username: session.identity.username.clone(),
        workstation: session.workstation.clone(),
    };
    let second = session_setup(
        transport,
        session_id,
        SessionSetupRequest::Blob(authenticate.encode()),
    )
    .await?;
    if second.header.status != Status::Success {
        return Err(rejection(Command::SessionSetup, second.header.status));
    }

    Ok(Established {
        session_id,
        server_challenge,
    })
}
