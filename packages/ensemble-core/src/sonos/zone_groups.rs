//! Zone group topology parsing.
//!
//! Handles parsing ZoneGroupState XML into a [`TopologySnapshot`].

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::sonos::types::{RendererId, TopologySnapshot, ZoneGroup, ZoneGroupMember};
use crate::sonos::utils::{endpoint_from_location, get_xml_attr};

/// Parses ZoneGroupState XML into a topology snapshot.
///
/// Expects the raw ZoneGroupState XML (already unescaped from the SOAP body).
///
/// # Filtering
/// - Zone Bridges (BOOST devices with `IsZoneBridge="1"`) are skipped as they
///   cannot play audio.
/// - Members without a UUID or a parseable Location are skipped.
/// - Groups whose coordinator is not among the remaining members are dropped.
pub fn parse_zone_group_xml(xml: &str) -> TopologySnapshot {
    let mut groups = Vec::new();
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();

    let mut current_coordinator: Option<RendererId> = None;
    let mut current_group_id = String::new();
    let mut current_members: Vec<ZoneGroupMember> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                b"ZoneGroup" => {
                    current_group_id = get_xml_attr(e, b"ID").unwrap_or_default();
                    current_coordinator = get_xml_attr(e, b"Coordinator").map(RendererId::from);
                    current_members.clear();
                }
                b"ZoneGroupMember" => {
                    if get_xml_attr(e, b"IsZoneBridge").as_deref() == Some("1") {
                        continue;
                    }

                    let Some(uuid) = get_xml_attr(e, b"UUID") else {
                        continue;
                    };
                    let Some(endpoint) =
                        get_xml_attr(e, b"Location").and_then(|l| endpoint_from_location(&l))
                    else {
                        continue;
                    };
                    let zone_name = get_xml_attr(e, b"ZoneName").unwrap_or_default();

                    current_members.push(ZoneGroupMember {
                        id: RendererId::from(uuid),
                        endpoint,
                        zone_name,
                    });
                }
                _ => {}
            },
            Ok(Event::End(ref e)) if e.name().as_ref() == b"ZoneGroup" => {
                let members = std::mem::take(&mut current_members);
                let Some(coordinator_id) = current_coordinator.take() else {
                    continue;
                };
                let Some(coordinator) = members
                    .iter()
                    .find(|m| m.id == coordinator_id)
                    .map(|m| m.endpoint.clone())
                else {
                    log::debug!(
                        "[Topology] Skipping group {} without reachable coordinator {}",
                        current_group_id,
                        coordinator_id
                    );
                    continue;
                };

                groups.push(ZoneGroup {
                    id: std::mem::take(&mut current_group_id),
                    coordinator_id,
                    coordinator,
                    members,
                });
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                log::warn!("[Topology] XML parse error in zone groups: {}", e);
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    TopologySnapshot::new(groups)
}
