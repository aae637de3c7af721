//! SDP text helpers

use crate::capture::MediaKind;

fn line_ending(sdp: &str) -> &'static str {
    if sdp.contains("\r\n") {
        "\r\n"
    } else {
        "\n"
    }
}

/// Add `b=AS` and `b=TIAS` lines to every media section of `kind`.
///
/// The lines go after the section's `c=` line when there is one, otherwise
/// right after the `m=` line. Existing bandwidth lines in those sections are
/// replaced.
pub fn apply_bitrate_cap(sdp: &str, kind: MediaKind, max_bitrate_bps: u64) -> String {
    let eol = line_ending(sdp);
    let media_prefix = format!("m={} ", kind.as_str());
    let bandwidth = [
        format!("b=AS:{}", max_bitrate_bps.div_ceil(1000)),
        format!("b=TIAS:{}", max_bitrate_bps),
    ];

    let mut out: Vec<String> = Vec::new();
    let mut in_section = false;
    let mut pending = false;

    for line in sdp.split(eol).filter(|l| !l.is_empty()) {
        if line.starts_with("m=") {
            if pending {
                out.extend(bandwidth.iter().cloned());
            }
            in_section = line.starts_with(&media_prefix);
            pending = in_section;
            out.push(line.to_string());
            continue;
        }

        if in_section && (line.starts_with("b=AS:") || line.starts_with("b=TIAS:")) {
            continue;
        }

        if pending && !line.starts_with("i=") && !line.starts_with("c=") {
            out.extend(bandwidth.iter().cloned());
            pending = false;
        }
        out.push(line.to_string());
    }
    if pending {
        out.extend(bandwidth.iter().cloned());
    }

    let mut sdp = out.join(eol);
    sdp.push_str(eol);
    sdp
}

/// Whether `text` looks like a session description at all.
pub fn looks_like_sdp(text: &str) -> bool {
    text.trim_start().starts_with("v=0")
}
