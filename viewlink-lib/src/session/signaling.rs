pub mod channel;

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// One ICE server entry as handed out by the broker.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct IceServer {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            ..Default::default()
        }
    }

    pub fn with_credentials(urls: Vec<String>, username: String, credential: String) -> Self {
        Self {
            urls,
            username: Some(username),
            credential: Some(credential),
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offer => write!(f, "offer"),
            Self::Answer => write!(f, "answer"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
}

impl SessionDescription {
    pub fn offer(sdp: String) -> Self {
        Self {
            sdp,
            sdp_type: SdpType::Offer,
        }
    }

    pub fn answer(sdp: String) -> Self {
        Self {
            sdp,
            sdp_type: SdpType::Answer,
        }
    }
}

/// Body of `sdp_reply`. The broker omits the type tag; a reply is always an
/// answer.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct SdpReply {
    pub sdp: String,
}

impl From<SdpReply> for SessionDescription {
    fn from(reply: SdpReply) -> Self {
        SessionDescription::answer(reply.sdp)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    IceServersRequest,
    IceServersResponse {
        #[serde(rename = "iceServers", default)]
        ice_servers: Vec<IceServer>,
    },
    IceServersError {
        #[serde(default)]
        error: String,
    },
    #[serde(rename = "sdp")]
    SdpOffer { data: SessionDescription },
    #[serde(rename = "sdp_reply")]
    SdpAnswer { data: SdpReply },
    IceCandidate { data: IceCandidate },
    IceCandidateReply { data: IceCandidate },
    #[serde(other)]
    Unknown,
}

impl SignalingMessage {
    pub fn offer(desc: SessionDescription) -> Self {
        Self::SdpOffer { data: desc }
    }

    pub fn candidate(candidate: IceCandidate) -> Self {
        Self::IceCandidate { data: candidate }
    }

    pub fn msg_type(&self) -> &'static str {
        match self {
            Self::IceServersRequest => "ice_servers_request",
            Self::IceServersResponse { .. } => "ice_servers_response",
            Self::IceServersError { .. } => "ice_servers_error",
            Self::SdpOffer { .. } => "sdp",
            Self::SdpAnswer { .. } => "sdp_reply",
            Self::IceCandidate { .. } => "ice_candidate",
            Self::IceCandidateReply { .. } => "ice_candidate_reply",
            Self::Unknown => "unknown",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
