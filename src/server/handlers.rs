//! Per-connection request handling.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use super::state::{session_signer, ServerSessionState, ServerState, ServerStats};
use crate::crypto::{
    identity_key, keyed_response, legacy_response, random_challenge, random_guid, secret_hash,
    signing_key, KeyMaterial,
};
use crate::error::Result;
use crate::protocol::{
    blob_flags, blob_type, signable, AuthenticateBlob, ChallengeBlob, Command, Frame, Header,
    HeaderFlags, NegotiateBlob, NegotiateRequest, NegotiateResponse, NegotiatedCaps,
    SessionSetupRequest, SessionSetupResponse, Status, TreeConnectRequest, TreeConnectResponse,
    CHALLENGE_SIZE, GUID_SIZE,
};

/// Share type reported for every share (disk)
const SHARE_TYPE_DISK: u8 = 1;

/// Access mask granted on tree connect
const FULL_ACCESS: u32 = 0x001F_01FF;

/// Reply under construction
struct Reply {
    status: Status,
    payload: Bytes,
    session_id: Option<u64>,
    tree_id: Option<u32>,
}

impl Reply {
    fn status(status: Status) -> Self {
        Self {
            status,
            payload: Bytes::new(),
            session_id: None,
            tree_id: None,
        }
    }

    fn ok(payload: Bytes) -> Self {
        Self {
            payload,
            ..Self::status(Status::Success)
        }
    }
}

/// State of one client connection
pub(crate) struct Connection {
    state: Arc<ServerState>,
    negotiated: Option<NegotiatedCaps>,
    challenge: [u8; CHALLENGE_SIZE],
    server_guid: [u8; GUID_SIZE],
}

impl Connection {
    pub(crate) fn new(state: Arc<ServerState>) -> Self {
        Self {
            state,
            negotiated: None,
            challenge: random_challenge(),
            server_guid: random_guid(),
        }
    }

    fn signing(&self) -> bool {
        self.negotiated.as_ref().is_some_and(|c| c.signing)
    }

    /// Answer one request. Usually one frame; an interim response comes
    /// first when configured.
    pub(crate) async fn handle(&mut self, request: Frame) -> Vec<Frame> {
        let header = request.header.clone();
        tracing::debug!(command = ?header.command, tag = header.tag, "Request");

        let seq = match self.check_signature(&request).await {
            Ok(seq) => seq,
            Err(status) => {
                tracing::warn!(tag = header.tag, "Rejecting badly signed request");
                return vec![Frame::new(Header::response_to(&header, status), Bytes::new())];
            }
        };

        let mut frames = Vec::with_capacity(2);
        if self.state.config.interim_responses && header.command == Command::Request {
            let mut interim = Header::response_to(&header, Status::Pending);
            interim.flags.set(HeaderFlags::ASYNC);
            frames.push(Frame::new(interim, Bytes::new()));
        }

        let reply = match self.dispatch(&request).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(error = %e, "Malformed request");
                Reply::status(Status::InvalidParameter)
            }
        };

        let mut response_header = Header::response_to(&header, reply.status);
        if let Some(session_id) = reply.session_id {
            response_header.session_id = session_id;
        }
        if let Some(tree_id) = reply.tree_id {
            response_header.tree_id = tree_id;
        }
        let mut response = Frame::new(response_header, reply.payload);

        if let Some(seq) = seq {
            self.sign_response(header.session_id, seq, &mut response).await;
        }
        if header.command == Command::Logoff && reply.status.is_success() {
            self.state.sessions.write().await.remove(&header.session_id);
        }

        frames.push(response);
        frames
    }

    /// Verify the request signature of a signing session and consume its
    /// sequence number.
    async fn check_signature(&self, request: &Frame) -> std::result::Result<Option<u64>, Status> {
        let header = &request.header;
        if header.session_id == 0
            || matches!(header.command, Command::Negotiate | Command::SessionSetup)
        {
            return Ok(None);
        }

        let mut sessions = self.state.sessions.write().await;
        let Some(ServerSessionState::Established {
            signer: Some(signer),
            next_seq,
            ..
        }) = sessions.get_mut(&header.session_id)
        else {
            return Ok(None);
        };

        if !header.is_signed() {
            return Err(Status::AccessDenied);
        }
        let seq = *next_seq;
        signer
            .verify(seq, &signable(&request.to_body()), &header.signature)
            .map_err(|_| Status::AccessDenied)?;
        *next_seq += 2;
        Ok(Some(seq))
    }

    async fn sign_response(&self, session_id: u64, seq: u64, response: &mut Frame) {
        let sessions = self.state.sessions.read().await;
        if let Some(ServerSessionState::Established {
            signer: Some(signer),
            ..
        }) = sessions.get(&session_id)
        {
            let signature = signer.sign(seq + 1, &signable(&response.to_body()));
            response.header.signature = signature;
            response.header.flags.set(HeaderFlags::SIGNED);
        }
    }

    async fn dispatch(&mut self, request: &Frame) -> Result<Reply> {
        let header = &request.header;
        let payload = request.payload.clone();

        match header.command {
            Command::Negotiate => self.negotiate(payload),
            Command::SessionSetup => self.session_setup(header.session_id, payload).await,
            Command::TreeConnect => self.tree_connect(header.session_id, payload).await,
            Command::TreeDisconnect => self.tree_disconnect(header).await,
            Command::Logoff => {
                ServerStats::bump(&self.state.stats.logoffs);
                let rejected = self.require_session(header.session_id).await;
                Ok(rejected.unwrap_or_else(|| Reply::ok(Bytes::new())))
            }
            Command::Echo => Ok(Reply::ok(Bytes::new())),
            Command::Request => self.generic_request(header, payload).await,
            Command::OplockBreak => Ok(Reply::ok(Bytes::new())),
        }
    }

    /// `Some(error reply)` when `session_id` is not an established session.
    async fn require_session(&self, session_id: u64) -> Option<Reply> {
        let sessions = self.state.sessions.read().await;
        match sessions.get(&session_id) {
            Some(ServerSessionState::Established { .. }) => None,
            _ => Some(Reply::status(Status::UserSessionDeleted)),
        }
    }

    fn negotiate(&mut self, payload: Bytes) -> Result<Reply> {
        ServerStats::bump(&self.state.stats.negotiates);
        let request = NegotiateRequest::decode(payload)?;
        let ours = &self.state.config.capabilities;

        let Some(caps) = ours.negotiate(&request.capabilities) else {
            return Ok(Reply::status(Status::NotSupported));
        };

        let response = NegotiateResponse {
            dialect: caps.dialect,
            flags: ours.flags,
            security: ours.security,
            max_frame_size: ours.max_frame_size,
            max_in_flight: ours.max_in_flight,
            server_guid: self.server_guid,
            challenge: self.challenge,
        };
        self.negotiated = Some(caps);
        Ok(Reply::ok(response.encode()))
    }

    async fn session_setup(&mut self, session_id: u64, payload: Bytes) -> Result<Reply> {
        ServerStats::bump(&self.state.stats.session_setups);
        let Some(caps) = self.negotiated.clone() else {
            return Ok(Reply::status(Status::InvalidParameter));
        };

        match SessionSetupRequest::decode(payload)? {
            SessionSetupRequest::Legacy {
                username, response, ..
            } => {
                let Some(user) = self.state.config.user(&username) else {
                    return Ok(Reply::status(Status::LogonFailure));
                };
                let secret = secret_hash(&user.password);
                if legacy_response(&secret, &self.challenge)[..] != response[..] {
                    return Ok(Reply::status(Status::LogonFailure));
                }

                let key = signing_key(&secret, &self.challenge)?;
                let id = self.establish(&username, &key, caps.signing).await;
                Ok(Reply {
                    session_id: Some(id),
                    ..Reply::ok(SessionSetupResponse::default().encode())
                })
            }
            SessionSetupRequest::Blob(blob) => match blob_type(&blob) {
                Some(NegotiateBlob::TYPE) => {
                    let hello = NegotiateBlob::decode(blob)?;
                    let keyed = caps.keyed_response() && hello.flags & blob_flags::KEYED != 0;
                    let server_challenge = random_challenge();
                    let id = self.state.allocate_session_id();
                    self.state.sessions.write().await.insert(
                        id,
                        ServerSessionState::Challenged {
                            server_challenge,
                            keyed,
                        },
                    );

                    let challenge = ChallengeBlob {
                        flags: if keyed { blob_flags::KEYED } else { 0 },
                        server_challenge,
                        target_name: self.state.config.target_name.clone(),
                    };
                    let response = SessionSetupResponse {
                        guest: false,
                        blob: challenge.encode(),
                    };
                    Ok(Reply {
                        status: Status::MoreProcessingRequired,
                        payload: response.encode(),
                        session_id: Some(id),
                        tree_id: None,
                    })
                }
                Some(AuthenticateBlob::TYPE) => {
                    let auth = AuthenticateBlob::decode(blob)?;
                    self.authenticate(session_id, auth, caps.signing).await
                }
                _ => Ok(Reply::status(Status::InvalidParameter)),
            },
        }
    }

    async fn authenticate(
        &self,
        session_id: u64,
        auth: AuthenticateBlob,
        signing: bool,
    ) -> Result<Reply> {
        let mut sessions = self.state.sessions.write().await;
        let Some(ServerSessionState::Challenged {
            server_challenge,
            keyed,
        }) = sessions.get(&session_id)
        else {
            return Ok(Reply::status(Status::UserSessionDeleted));
        };
        let (server_challenge, keyed) = (*server_challenge, *keyed);

        let Some(user) = self.state.config.user(&auth.username) else {
            sessions.remove(&session_id);
            return Ok(Reply::status(Status::LogonFailure));
        };
        let secret = secret_hash(&user.password);

        let expected: Vec<u8> = if keyed && auth.flags & blob_flags::KEYED != 0 {
            let key = identity_key(&secret, &auth.username, &auth.domain)?;
            keyed_response(&key, &server_challenge, &auth.client_challenge)?.to_vec()
        } else {
            legacy_response(&secret, &server_challenge).to_vec()
        };
        if expected[..] != auth.response[..] {
            sessions.remove(&session_id);
            tracing::info!(user = %auth.username, "Logon failure");
            return Ok(Reply::status(Status::LogonFailure));
        }

        let key = signing_key(&secret, &server_challenge)?;
        sessions.insert(
            session_id,
            ServerSessionState::Established {
                username: auth.username.clone(),
                signer: session_signer(&key, signing),
                next_seq: 0,
                trees: HashMap::new(),
            },
        );
        tracing::info!(user = %auth.username, session_id, "Session established");
        Ok(Reply {
            session_id: Some(session_id),
            ..Reply::ok(SessionSetupResponse::default().encode())
        })
    }

    async fn establish(&self, username: &str, key: &KeyMaterial, signing: bool) -> u64 {
        let id = self.state.allocate_session_id();
        self.state.sessions.write().await.insert(
            id,
            ServerSessionState::Established {
                username: username.to_string(),
                signer: session_signer(key, signing),
                next_seq: 0,
                trees: HashMap::new(),
            },
        );
        tracing::info!(user = %username, session_id = id, "Session established");
        id
    }

    async fn tree_connect(&self, session_id: u64, payload: Bytes) -> Result<Reply> {
        ServerStats::bump(&self.state.stats.tree_connects);
        let request = TreeConnectRequest::decode(payload)?;
        let share = request
            .path
            .rsplit('\\')
            .next()
            .unwrap_or_default()
            .to_string();

        let mut sessions = self.state.sessions.write().await;
        let Some(ServerSessionState::Established { trees, .. }) = sessions.get_mut(&session_id)
        else {
            return Ok(Reply::status(Status::UserSessionDeleted));
        };
        if !self.state.config.has_share(&share) {
            return Ok(Reply::status(Status::BadNetworkName));
        }

        let tree_id = self.state.allocate_tree_id();
        trees.insert(tree_id, share);
        let response = TreeConnectResponse {
            share_type: SHARE_TYPE_DISK,
            maximal_access: FULL_ACCESS,
        };
        Ok(Reply {
            tree_id: Some(tree_id),
            ..Reply::ok(response.encode())
        })
    }

    async fn tree_disconnect(&self, header: &Header) -> Result<Reply> {
        let mut sessions = self.state.sessions.write().await;
        match sessions.get_mut(&header.session_id) {
            Some(ServerSessionState::Established { trees, .. }) => {
                trees.remove(&header.tree_id);
                Ok(Reply::ok(Bytes::new()))
            }
            _ => Ok(Reply::status(Status::UserSessionDeleted)),
        }
    }

    /// Echo the payload back on a connected tree.
    async fn generic_request(&self, header: &Header, payload: Bytes) -> Result<Reply> {
        ServerStats::bump(&self.state.stats.requests);
        let sessions = self.state.sessions.read().await;
        match sessions.get(&header.session_id) {
            Some(ServerSessionState::Established { trees, .. }) => {
                if header.tree_id != 0 && !trees.contains_key(&header.tree_id) {
                    return Ok(Reply::status(Status::InvalidParameter));
                }
                Ok(Reply::ok(payload))
            }
            _ => Ok(Reply::status(Status::UserSessionDeleted)),
        }
    }
}
