//! UPnP SOAP plumbing: actions, envelopes and the HTTP round trip.
//!
//! A [`SoapAction`] is an owned description of one call (service, action
//! name, ordered arguments). It can be cloned and re-sent, which is what the
//! read-query retry path relies on. Command semantics live in `client.rs`.

use std::time::{Duration, Instant};

use reqwest::Client;
use thiserror::Error;

use super::types::Endpoint;
use super::utils::{escape_xml, extract_xml_text};
use crate::protocol_constants::SOAP_TIMEOUT_SECS;

// ─── Errors ───

/// Errors that can occur while talking SOAP to a player.
#[derive(Debug, Error)]
pub enum SoapError {
    /// HTTP request to the player failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Player answered with a non-success status and no SOAP fault.
    #[error("HTTP error {0}: {1}")]
    HttpStatus(u16, String),

    /// Player rejected the action with a SOAP fault.
    #[error("SOAP fault: {0}")]
    Fault(String),

    /// Response did not contain the expected fields.
    #[error("Failed to parse SOAP response")]
    Parse,
}

pub type SoapResult<T> = Result<T, SoapError>;

/// UPnP error codes Sonos returns while it is still settling into a state.
///
/// 701 transition not available, 714 illegal seek target, 716 resource not found.
const TRANSIENT_UPNP_CODES: [&str; 3] = ["(701)", "(714)", "(716)"];

impl SoapError {
    /// Whether re-sending the same read query may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Fault(msg) => {
                TRANSIENT_UPNP_CODES.iter().any(|code| msg.contains(code))
                    || msg.to_lowercase().contains("transition")
            }
            Self::Http(e) => e.is_timeout(),
            _ => false,
        }
    }

    /// Whether the player could not be reached at all.
    ///
    /// A fault or a bad status means the player answered.
    #[must_use]
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Http(e) if e.is_connect() || e.is_timeout())
    }
}

// ─── Services ───

/// UPnP services the engine addresses.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum SonosService {
    /// Queue, transport source and playback control.
    AVTransport,
    /// Group volume and mute; only meaningful on a coordinator.
    GroupRenderingControl,
    /// Zone group membership.
    ZoneGroupTopology,
}

impl SonosService {
    #[must_use]
    pub fn urn(self) -> &'static str {
        match self {
            Self::AVTransport => "urn:schemas-upnp-org:service:AVTransport:1",
            Self::GroupRenderingControl => "urn:schemas-upnp-org:service:GroupRenderingControl:1",
            Self::ZoneGroupTopology => "urn:schemas-upnp-org:service:ZoneGroupTopology:1",
        }
    }

    #[must_use]
    pub fn control_path(self) -> &'static str {
        match self {
            Self::AVTransport => "/MediaRenderer/AVTransport/Control",
            Self::GroupRenderingControl => "/MediaRenderer/GroupRenderingControl/Control",
            Self::ZoneGroupTopology => "/ZoneGroupTopology/Control",
        }
    }

    /// Whether the service's actions take the `InstanceID` argument.
    fn has_instances(self) -> bool {
        !matches!(self, Self::ZoneGroupTopology)
    }
}

// ─── Actions ───

/// One SOAP call, ready to be sent to any endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoapAction {
    service: SonosService,
    name: &'static str,
    args: Vec<(&'static str, String)>,
}

impl SoapAction {
    /// Starts an action. `InstanceID=0` is added first for services that use it.
    #[must_use]
    pub fn new(service: SonosService, name: &'static str) -> Self {
        let mut args = Vec::new();
        if service.has_instances() {
            args.push(("InstanceID", "0".to_string()));
        }
        Self {
            service,
            name,
            args,
        }
    }

    #[must_use]
    pub fn av_transport(name: &'static str) -> Self {
        Self::new(SonosService::AVTransport, name)
    }

    #[must_use]
    pub fn group_rendering(name: &'static str) -> Self {
        Self::new(SonosService::GroupRenderingControl, name)
    }

    #[must_use]
    pub fn topology(name: &'static str) -> Self {
        Self::new(SonosService::ZoneGroupTopology, name)
    }

    /// Appends an argument. Order is preserved in the envelope.
    #[must_use]
    pub fn arg(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.args.push((key, value.into()));
        self
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Renders the request envelope.
    ///
    /// Sonos rejects envelopes with whitespace before the root element, so
    /// the output is a single line.
    #[must_use]
    pub fn envelope(&self) -> String {
        let urn = self.service.urn();
        let mut body = format!(
            r#"<?xml version="1.0" encoding="utf-8"?><s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/"><s:Body><u:{} xmlns:u="{}">"#,
            self.name, urn
        );
        for (key, value) in &self.args {
            body.push_str(&format!("<{key}>{}</{key}>", escape_xml(value)));
        }
        body.push_str(&format!("</u:{}></s:Body></s:Envelope>", self.name));
        body
    }

    /// Sends the action and returns the raw response body.
    pub async fn send(&self, http: &Client, endpoint: &Endpoint) -> SoapResult<String> {
        let url = format!("{}{}", endpoint.base_url(), self.service.control_path());
        let body = self.envelope();
        log::trace!("[SOAP] {} -> {}: {}", self.name, url, body);

        let started = Instant::now();
        let response = http
            .post(&url)
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .header(
                "SOAPAction",
                format!("\"{}#{}\"", self.service.urn(), self.name),
            )
            .body(body)
            .timeout(Duration::from_secs(SOAP_TIMEOUT_SECS))
            .send()
            .await;
        log::debug!(
            "[SOAP] {} on {} took {:?}",
            self.name,
            endpoint,
            started.elapsed()
        );

        let response = response?;
        let status = response.status();
        let text = response.text().await?;

        // Faults arrive with a 500 status, so look for them before the status
        if let Some(fault) = parse_fault(&text) {
            return Err(SoapError::Fault(fault));
        }
        if !status.is_success() {
            return Err(SoapError::HttpStatus(status.as_u16(), text));
        }
        Ok(text)
    }
}

/// Returns `"faultstring (errorCode)"` if the body is a SOAP fault.
fn parse_fault(xml: &str) -> Option<String> {
    if !xml.contains(":Fault>") {
        return None;
    }
    let fault = extract_xml_text(xml, "faultstring").unwrap_or_else(|| "Unknown SOAP fault".into());
    Some(match extract_xml_text(xml, "errorCode") {
        Some(code) => format!("{} ({})", fault, code),
        None => fault,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_actions_lead_with_instance_id() {
        let action = SoapAction::av_transport("AddURIToQueue")
            .arg("EnqueuedURI", "x-file-cifs://nas/a.mp3")
            .arg("EnqueueAsNext", "1");

        assert_eq!(action.args[0], ("InstanceID", "0".to_string()));
        assert_eq!(action.args[2], ("EnqueueAsNext", "1".to_string()));
        assert!(SoapAction::topology("GetZoneGroupState").args.is_empty());
    }

    #[test]
    fn envelope_is_one_line_and_escapes_values() {
        let body = SoapAction::av_transport("SetAVTransportURI")
            .arg("CurrentURI", "http://host/a?x=1&y=2")
            .envelope();

        assert!(body.starts_with("<?xml"));
        assert!(!body.contains('\n'));
        assert!(body.contains("<CurrentURI>http://host/a?x=1&amp;y=2</CurrentURI>"));
        assert!(body.ends_with("</u:SetAVTransportURI></s:Body></s:Envelope>"));
    }

    #[test]
    fn fault_carries_the_upnp_error_code() {
        let xml = "<s:Envelope><s:Body><s:Fault><faultstring>UPnPError</faultstring><detail><UPnPError><errorCode>701</errorCode></UPnPError></detail></s:Fault></s:Body></s:Envelope>";
        let fault = parse_fault(xml).expect("fault");

        assert_eq!(fault, "UPnPError (701)");
        assert!(SoapError::Fault(fault).is_transient());
        assert!(!SoapError::Fault("UPnPError (800)".into()).is_transient());
        assert!(parse_fault("<u:PlayResponse/>").is_none());
    }

    #[test]
    fn faults_are_not_connection_failures() {
        assert!(!SoapError::Fault("UPnPError (800)".into()).is_connection_failure());
        assert!(!SoapError::Parse.is_connection_failure());
    }
}
