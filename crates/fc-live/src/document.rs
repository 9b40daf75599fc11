//! Builders for the MPSD session documents.

use chrono::Utc;
use uuid::Uuid;

use crate::models::*;

/// What one game server advertises: display names, the actual address
/// players connect to, and the protocol/version/capacity shown in the UI.
#[derive(Debug, Clone)]
pub struct ServerAdvert {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub host_name: String,
    pub world_name: String,
    pub version: String,
    pub protocol: u32,
    pub max_players: u32,
}

/// Session names are unique per controller lifetime.
pub fn session_name(server_id: &str) -> String {
    format!("FriendConnect-{}-{}", server_id, Utc::now().timestamp_millis())
}

/// Freshly computed custom properties. Called on create and on every
/// heartbeat so `MemberCount` and `lastUpdate` stay current.
pub fn build_custom_properties(
    advert: &ServerAdvert,
    host_xuid: &str,
    member_count: u32,
    raknet_guid: &str,
) -> CustomProperties {
    CustomProperties {
        broadcast_setting: 3,
        cross_play_disabled: false,
        joinability: "joinable_by_friends".to_string(),
        lan_game: true,
        max_member_count: advert.max_players,
        member_count,
        online_cross_platform_game: true,
        supported_connections: vec![SupportedConnection {
            connection_type: 6,
            host_ip_address: advert.address.clone(),
            host_port: advert.port,
            raknet_guid: raknet_guid.to_string(),
        }],
        title_id: TITLE_ID,
        transport_layer: 0,
        level_id: "level".to_string(),
        host_name: advert.host_name.clone(),
        owner_id: host_xuid.to_string(),
        raknet_guid: raknet_guid.to_string(),
        world_name: advert.world_name.clone(),
        world_type: "Survival".to_string(),
        protocol: advert.protocol,
        version: advert.version.clone(),
        last_update: Utc::now().timestamp(),
    }
}

/// The full document PUT on session create, under the host identity.
/// The member subscription id is a fresh UUID per session.
pub fn build_session_document(
    advert: &ServerAdvert,
    host_xuid: &str,
    member_count: u32,
    raknet_guid: &str,
) -> SessionDocument {
    SessionDocument {
        properties: SessionProperties {
            system: SystemProperties {
                join_restriction: "followed".to_string(),
                read_restriction: "followed".to_string(),
                closed: false,
            },
            custom: build_custom_properties(advert, host_xuid, member_count, raknet_guid),
        },
        members: build_member(host_xuid).members,
    }
}

/// The `members.me`-only document PUT by each non-host identity.
pub fn build_member(xuid: &str) -> MemberJoinDocument {
    MemberJoinDocument {
        members: SessionMembers {
            me: SessionMember {
                constants: MemberConstants {
                    system: MemberConstantsSystem {
                        xuid: xuid.to_string(),
                        initialize: true,
                    },
                },
                properties: MemberProperties {
                    system: MemberPropertiesSystem {
                        active: true,
                        connection: Uuid::new_v4().to_string(),
                        subscription: MemberSubscription {
                            id: Uuid::new_v4().to_string(),
                            change_types: vec!["everything".to_string()],
                        },
                    },
                },
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    fn advert() -> ServerAdvert {
        ServerAdvert {
            id: "main-server".to_string(),
            address: "play.example.com".to_string(),
            port: 19132,
            host_name: "Example Server".to_string(),
            world_name: "Example World".to_string(),
            version: "1.21.0".to_string(),
            protocol: 686,
            max_players: 40,
        }
    }

    #[test]
    fn session_name_has_server_id_and_timestamp() {
        let name = session_name("main-server");
        let re = Regex::new(r"^FriendConnect-main-server-\d+$").unwrap();
        assert!(re.is_match(&name), "name was {name}");
    }

    #[test]
    fn session_document_carries_exact_wire_keys() {
        let doc = build_session_document(&advert(), "2535412345678901", 2, "guid-1");
        let value = serde_json::to_value(&doc).unwrap();

        let system = &value["properties"]["system"];
        assert_eq!(system["joinRestriction"], "followed");
        assert_eq!(system["readRestriction"], "followed");
        assert_eq!(system["closed"], false);

        let custom = &value["properties"]["custom"];
        assert_eq!(custom["BroadcastSetting"], 3);
        assert_eq!(custom["CrossPlayDisabled"], false);
        assert_eq!(custom["Joinability"], "joinable_by_friends");
        assert_eq!(custom["LanGame"], true);
        assert_eq!(custom["MaxMemberCount"], 40);
        assert_eq!(custom["MemberCount"], 2);
        assert_eq!(custom["OnlineCrossPlatformGame"], true);
        assert_eq!(custom["TitleId"], 1739947436u64);
        assert_eq!(custom["TransportLayer"], 0);
        assert_eq!(custom["levelId"], "level");
        assert_eq!(custom["hostName"], "Example Server");
        assert_eq!(custom["ownerId"], "2535412345678901");
        assert_eq!(custom["worldName"], "Example World");
        assert_eq!(custom["worldType"], "Survival");
        assert_eq!(custom["protocol"], 686);
        assert_eq!(custom["version"], "1.21.0");

        let connection = &custom["SupportedConnections"][0];
        assert_eq!(connection["ConnectionType"], 6);
        assert_eq!(connection["HostIpAddress"], "play.example.com");
        assert_eq!(connection["HostPort"], 19132);
        assert_eq!(connection["RakNetGUID"], "guid-1");

        let me = &value["members"]["me"];
        assert_eq!(me["constants"]["system"]["xuid"], "2535412345678901");
        assert_eq!(me["constants"]["system"]["initialize"], true);
        assert_eq!(me["properties"]["system"]["active"], true);
        assert_eq!(
            me["properties"]["system"]["subscription"]["changeTypes"][0],
            "everything"
        );
    }

    #[test]
    fn member_document_contains_only_members_me() {
        let doc = build_member("2535498765432109");
        let value = serde_json::to_value(&doc).unwrap();

        assert!(value.get("properties").is_none());
        assert_eq!(
            value["members"]["me"]["constants"]["system"]["xuid"],
            "2535498765432109"
        );
    }

    #[test]
    fn subscription_ids_are_fresh_per_member() {
        let a = build_member("2535400000000001");
        let b = build_member("2535400000000001");
        assert_ne!(
            a.members.me.properties.system.subscription.id,
            b.members.me.properties.system.subscription.id
        );
    }

    #[test]
    fn heartbeat_properties_tick_last_update() {
        let first = build_custom_properties(&advert(), "253541", 2, "g");
        assert!(first.last_update > 0);
        assert_eq!(first.member_count, 2);

        let second = build_custom_properties(&advert(), "253541", 3, "g");
        assert_eq!(second.member_count, 3);
        assert!(second.last_update >= first.last_update);
    }
}
