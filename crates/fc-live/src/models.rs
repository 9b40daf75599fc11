use serde::{Deserialize, Serialize};

/// MPSD service configuration id for the Minecraft title.
pub const SERVICE_CONFIG_ID: &str = "4fc10100-5f7a-4470-899b-280835760c07";

/// Session template the coordinator writes into.
pub const SESSION_TEMPLATE: &str = "MinecraftLobby";

/// MPSD contract version for session writes.
pub const MPSD_CONTRACT_VERSION: &str = "107";

/// Contract version for social (people) calls.
pub const SOCIAL_CONTRACT_VERSION: &str = "1";

/// Title id advertised in the session custom properties.
pub const TITLE_ID: u64 = 1739947436;

/// Full MPSD session document sent on create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDocument {
    pub properties: SessionProperties,
    pub members: SessionMembers,
}

/// Heartbeat document: replaces only the custom properties block.
#[derive(Debug, Clone, Serialize)]
pub struct SessionPropertiesUpdate {
    pub properties: CustomOnlyProperties,
}

#[derive(Debug, Clone, Serialize)]
pub struct CustomOnlyProperties {
    pub custom: CustomProperties,
}

/// Member-join document: the `members.me` portion only, sent under each
/// joining identity's own authorization.
#[derive(Debug, Clone, Serialize)]
pub struct MemberJoinDocument {
    pub members: SessionMembers,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionProperties {
    pub system: SystemProperties,
    pub custom: CustomProperties,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemProperties {
    #[serde(rename = "joinRestriction")]
    pub join_restriction: String,
    #[serde(rename = "readRestriction")]
    pub read_restriction: String,
    pub closed: bool,
}

/// The custom properties block consoles read to render the joinable entry.
/// Exact key spelling is load-bearing for client compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomProperties {
    #[serde(rename = "BroadcastSetting")]
    pub broadcast_setting: u32,
    #[serde(rename = "CrossPlayDisabled")]
    pub cross_play_disabled: bool,
    #[serde(rename = "Joinability")]
    pub joinability: String,
    #[serde(rename = "LanGame")]
    pub lan_game: bool,
    #[serde(rename = "MaxMemberCount")]
    pub max_member_count: u32,
    #[serde(rename = "MemberCount")]
    pub member_count: u32,
    #[serde(rename = "OnlineCrossPlatformGame")]
    pub online_cross_platform_game: bool,
    #[serde(rename = "SupportedConnections")]
    pub supported_connections: Vec<SupportedConnection>,
    #[serde(rename = "TitleId")]
    pub title_id: u64,
    #[serde(rename = "TransportLayer")]
    pub transport_layer: u32,
    #[serde(rename = "levelId")]
    pub level_id: String,
    #[serde(rename = "hostName")]
    pub host_name: String,
    #[serde(rename = "ownerId")]
    pub owner_id: String,
    #[serde(rename = "rakNetGUID")]
    pub raknet_guid: String,
    #[serde(rename = "worldName")]
    pub world_name: String,
    #[serde(rename = "worldType")]
    pub world_type: String,
    pub protocol: u32,
    pub version: String,
    #[serde(rename = "lastUpdate")]
    pub last_update: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportedConnection {
    #[serde(rename = "ConnectionType")]
    pub connection_type: u32,
    #[serde(rename = "HostIpAddress")]
    pub host_ip_address: String,
    #[serde(rename = "HostPort")]
    pub host_port: u16,
    #[serde(rename = "RakNetGUID")]
    pub raknet_guid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMembers {
    pub me: SessionMember,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMember {
    pub constants: MemberConstants,
    pub properties: MemberProperties,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberConstants {
    pub system: MemberConstantsSystem,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberConstantsSystem {
    pub xuid: String,
    pub initialize: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberProperties {
    pub system: MemberPropertiesSystem,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberPropertiesSystem {
    pub active: bool,
    pub connection: String,
    pub subscription: MemberSubscription,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberSubscription {
    pub id: String,
    #[serde(rename = "changeTypes")]
    pub change_types: Vec<String>,
}

/// One person from `GET /users/me/people/xuid({xuid})` or the people list.
#[derive(Debug, Clone, Deserialize)]
pub struct PersonSummary {
    #[serde(default)]
    pub xuid: Option<String>,
    #[serde(rename = "isFollowedByCaller", default)]
    pub is_followed_by_caller: bool,
    #[serde(rename = "isFollowingCaller", default)]
    pub is_following_caller: bool,
}

/// Response of `GET /users/me/people`.
#[derive(Debug, Clone, Deserialize)]
pub struct PeopleResponse {
    #[serde(default)]
    pub people: Vec<PersonSummary>,
    #[serde(rename = "totalCount", default)]
    pub total_count: u64,
}
