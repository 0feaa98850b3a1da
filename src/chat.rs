//! Direct messages through the Bluesky chat service.
use std::future::Future;

use atrium_api::types::string::Did;
use serde::{Deserialize, Serialize, de::IgnoredAny};
use tracing::{debug, info};

use crate::{
    auth::{Session, xrpc_url},
    error::ApiError,
};

/// `atproto-proxy` header value for the chat service.
const CHAT_PROXY: &str = "did:web:api.bsky.chat#bsky_chat";

/// A link over `byte_start..byte_end` of a message's UTF-8 text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkFacet {
    pub byte_start: usize,
    pub byte_end: usize,
    pub uri: String,
}

impl LinkFacet {
    /// A facet over the last occurrence of `uri` in `text`.
    pub fn last_in(text: &str, uri: &str) -> Option<Self> {
        text.rfind(uri).map(|byte_start| Self {
            byte_start,
            byte_end: byte_start + uri.len(),
            uri: uri.to_owned(),
        })
    }
}

/// Delivers direct messages. Implementations own their session and
/// conversation lookup.
pub trait MessagingGateway: Send + Sync {
    fn send_direct_message(
        &self,
        recipient: &Did,
        text: &str,
        links: &[LinkFacet],
    ) -> impl Future<Output = Result<(), ApiError>> + Send;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ByteSlice {
    byte_start: usize,
    byte_end: usize,
}

#[derive(Serialize)]
#[serde(tag = "$type")]
enum FacetFeature<'a> {
    #[serde(rename = "app.bsky.richtext.facet#link")]
    Link { uri: &'a str },
}

#[derive(Serialize)]
struct Facet<'a> {
    index: ByteSlice,
    features: Vec<FacetFeature<'a>>,
}

#[derive(Serialize)]
struct MessageInput<'a> {
    text: &'a str,
    facets: Vec<Facet<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageInput<'a> {
    convo_id: &'a str,
    message: MessageInput<'a>,
}

#[derive(Deserialize)]
struct ConvoView {
    id: String,
}

#[derive(Deserialize)]
struct GetConvoForMembersOutput {
    convo: ConvoView,
}

/// [`MessagingGateway`] using `chat.bsky.convo`.
pub struct ChatClient {
    session: Session,
}

impl ChatClient {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub async fn login(&self) -> Result<Did, ApiError> {
        self.session.login().await
    }

    /// Find or create the conversation between this account and `member`.
    async fn convo_with(&self, member: &Did) -> Result<String, ApiError> {
        let url = xrpc_url(self.session.service(), "chat.bsky.convo.getConvoForMembers");
        let output: GetConvoForMembersOutput = self
            .session
            .send(|client| {
                client
                    .get(&url)
                    .header("atproto-proxy", CHAT_PROXY)
                    .query(&[("members", member.as_str())])
            })
            .await?;

        debug!("using convo {} with {}", output.convo.id, member.as_str());
        Ok(output.convo.id)
    }
}

impl MessagingGateway for ChatClient {
    async fn send_direct_message(
        &self,
        recipient: &Did,
        text: &str,
        links: &[LinkFacet],
    ) -> Result<(), ApiError> {
        let convo_id = self.convo_with(recipient).await?;

        let url = xrpc_url(self.session.service(), "chat.bsky.convo.sendMessage");
        let input = SendMessageInput {
            convo_id: &convo_id,
            message: MessageInput {
                text,
                facets: links
                    .iter()
                    .map(|l| Facet {
                        index: ByteSlice {
                            byte_start: l.byte_start,
                            byte_end: l.byte_end,
                        },
                        features: vec![FacetFeature::Link { uri: &l.uri }],
                    })
                    .collect(),
            },
        };

        let _message: IgnoredAny = self
            .session
            .send(|client| {
                client
                    .post(&url)
                    .header("atproto-proxy", CHAT_PROXY)
                    .json(&input)
            })
            .await?;

        info!("sent DM to {}", recipient.as_str());
        Ok(())
    }
}
