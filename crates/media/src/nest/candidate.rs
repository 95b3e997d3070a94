//! Nest SDP answer surgery.
//!
//! The SDM answer embeds `a=candidate:` lines that webrtc-rs's SDP parser
//! rejects (missing foundations, uppercase transports, `ssltcp`). The answer
//! is split: candidate lines are stripped from the SDP passed to
//! `set_remote_description` and re-added individually via trickle ICE after
//! normalization.

/// A candidate extracted from the answer, with the media section it
/// belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCandidate {
    /// The raw attribute value (everything after `a=`).
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: u16,
}

#[derive(Debug, Clone)]
pub struct StrippedAnswer {
    /// The answer SDP with all candidate lines removed.
    pub sdp: String,
    pub candidates: Vec<RemoteCandidate>,
}

/// Split the answer into a candidate-free SDP and the candidate lines with
/// their (mid, m-line index) coordinates.
pub fn strip_candidates(answer_sdp: &str) -> StrippedAnswer {
    let mut mid: Option<String> = None;
    let mut mline_index: Option<u16> = None;
    let mut kept: Vec<&str> = Vec::new();
    let mut candidates = Vec::new();

    for raw_line in answer_sdp.lines() {
        let line = raw_line.trim_end_matches('\r');
        if line.starts_with("m=") {
            mline_index = Some(match mline_index {
                None => 0,
                Some(i) => i + 1,
            });
            mid = None;
            kept.push(line);
        } else if let Some(value) = line.strip_prefix("a=mid:") {
            mid = Some(value.trim().to_string());
            kept.push(line);
        } else if let Some(value) = line.strip_prefix("a=candidate:") {
            candidates.push(RemoteCandidate {
                candidate: format!("candidate:{value}"),
                sdp_mid: mid.clone(),
                sdp_mline_index: mline_index.unwrap_or(0),
            });
        } else {
            kept.push(line);
        }
    }

    let mut sdp = kept.join("\r\n");
    sdp.push_str("\r\n");
    StrippedAnswer { sdp, candidates }
}

fn is_transport(token: &str) -> bool {
    matches!(
        token.to_ascii_lowercase().as_str(),
        "udp" | "tcp" | "ssltcp"
    )
}

/// Normalize one candidate line into a form the ICE parser accepts.
/// Returns None for candidates that cannot be repaired.
pub fn normalize_candidate(line: &str) -> Option<String> {
    let trimmed = line.trim();
    let rest = trimmed.strip_prefix("a=").unwrap_or(trimmed);
    let rest = rest.strip_prefix("candidate:").unwrap_or(rest);

    let tokens: Vec<&str> = rest.split_whitespace().collect();
    if tokens.len() < 7 {
        return None;
    }

    // A well-formed candidate has [foundation, component, transport, ...];
    // Nest sometimes omits the foundation, leaving [component, transport, ...].
    let (foundation, fields): (String, &[&str]) =
        if tokens[1].parse::<u32>().is_ok() && is_transport(tokens[2]) {
            (tokens[0].to_string(), &tokens[1..])
        } else if tokens[0].parse::<u32>().is_ok() && is_transport(tokens[1]) {
            (format!("nest{}", tokens[2]), &tokens[..])
        } else {
            return None;
        };

    if fields.len() < 7 {
        return None;
    }

    let component: u32 = fields[0].parse().ok()?;
    let mut transport = fields[1].to_ascii_lowercase();
    if transport == "ssltcp" {
        transport = "tcp".to_string();
    }
    let priority = fields[2];
    let address = fields[3];
    let port: u16 = fields[4].parse().ok()?;
    if !fields[5].eq_ignore_ascii_case("typ") {
        return None;
    }
    let candidate_type = fields[6].to_ascii_lowercase();

    let mut out = format!(
        "candidate:{foundation} {component} {transport} {priority} {address} {port} typ {candidate_type}"
    );
    for token in &fields[7..] {
        out.push(' ');
        if token.eq_ignore_ascii_case("tcptype") {
            out.push_str("tcpType");
        } else if token.eq_ignore_ascii_case("raddr") {
            out.push_str("raddr");
        } else if token.eq_ignore_ascii_case("rport") {
            out.push_str("rport");
        } else {
            out.push_str(token);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_candidate_passes_through() {
        let normalized =
            normalize_candidate("candidate:1 1 udp 2113939711 1.2.3.4 19305 typ host").unwrap();
        assert_eq!(
            normalized,
            "candidate:1 1 udp 2113939711 1.2.3.4 19305 typ host"
        );
    }

    #[test]
    fn missing_foundation_is_synthesized_from_priority() {
        let normalized =
            normalize_candidate(" 1 udp 2113939711 5.6.7.8 19305 typ host").unwrap();
        assert_eq!(
            normalized,
            "candidate:nest2113939711 1 udp 2113939711 5.6.7.8 19305 typ host"
        );
    }

    #[test]
    fn transport_is_lowercased_and_ssltcp_mapped() {
        let normalized =
            normalize_candidate("candidate:x 1 SSLTCP 100 1.2.3.4 443 TYP RELAY").unwrap();
        assert_eq!(normalized, "candidate:x 1 tcp 100 1.2.3.4 443 typ relay");
    }

    #[test]
    fn a_prefix_is_stripped() {
        let normalized =
            normalize_candidate("a=candidate:f 1 UDP 99 9.9.9.9 1000 typ srflx").unwrap();
        assert!(normalized.starts_with("candidate:f 1 udp 99"));
    }

    #[test]
    fn tcptype_attribute_is_camel_cased() {
        let normalized = normalize_candidate(
            "candidate:f 1 tcp 99 9.9.9.9 1000 typ host tcptype passive",
        )
        .unwrap();
        assert!(normalized.ends_with("typ host tcpType passive"));
    }

    #[test]
    fn raddr_rport_lowercased_with_values_kept() {
        let normalized = normalize_candidate(
            "candidate:f 1 udp 99 9.9.9.9 1000 typ srflx RADDR 10.0.0.1 RPORT 5000",
        )
        .unwrap();
        assert!(normalized.ends_with("typ srflx raddr 10.0.0.1 rport 5000"));
    }

    #[test]
    fn rejects_short_lines() {
        assert!(normalize_candidate("candidate:1 1 udp 99").is_none());
        assert!(normalize_candidate("").is_none());
    }

    #[test]
    fn rejects_non_numeric_component_or_port() {
        assert!(
            normalize_candidate("candidate:f abc udp 99 9.9.9.9 1000 typ host").is_none()
        );
        assert!(
            normalize_candidate("candidate:f 1 udp 99 9.9.9.9 port typ host").is_none()
        );
    }

    #[test]
    fn rejects_missing_typ_token() {
        assert!(
            normalize_candidate("candidate:f 1 udp 99 9.9.9.9 1000 kind host").is_none()
        );
    }

    #[test]
    fn strip_collects_candidates_with_mid_and_index() {
        let answer = "v=0\r\n\
                      o=- 0 0 IN IP4 127.0.0.1\r\n\
                      m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
                      a=mid:0\r\n\
                      a=candidate:1 1 udp 2113939711 1.2.3.4 19305 typ host\r\n\
                      m=video 9 UDP/TLS/RTP/SAVPF 102\r\n\
                      a=mid:1\r\n\
                      a=candidate: 1 udp 2113939711 5.6.7.8 19305 typ host\r\n";

        let stripped = strip_candidates(answer);
        assert!(!stripped.sdp.contains("a=candidate"));
        assert!(stripped.sdp.contains("a=mid:0"));
        assert_eq!(stripped.candidates.len(), 2);

        assert_eq!(stripped.candidates[0].sdp_mid.as_deref(), Some("0"));
        assert_eq!(stripped.candidates[0].sdp_mline_index, 0);
        assert_eq!(stripped.candidates[1].sdp_mid.as_deref(), Some("1"));
        assert_eq!(stripped.candidates[1].sdp_mline_index, 1);

        // The first normalizes verbatim, the second gets a synthetic
        // foundation.
        let first = normalize_candidate(&stripped.candidates[0].candidate).unwrap();
        assert_eq!(
            first,
            "candidate:1 1 udp 2113939711 1.2.3.4 19305 typ host"
        );
        let second = normalize_candidate(&stripped.candidates[1].candidate).unwrap();
        assert_eq!(
            second,
            "candidate:nest2113939711 1 udp 2113939711 5.6.7.8 19305 typ host"
        );
    }

    #[test]
    fn strip_keeps_candidate_free_answers_intact() {
        let answer = "v=0\r\nm=audio 9 RTP 111\r\na=mid:0\r\n";
        let stripped = strip_candidates(answer);
        assert_eq!(stripped.sdp, answer);
        assert!(stripped.candidates.is_empty());
    }
}
