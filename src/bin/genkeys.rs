//! Sign stream keys read from stdin.
//!
//! Prints `input,whip_key,whep_key` per line. The HMAC key comes from
//! `HMAC_KEY`, loaded from `.env.production` when `APP_ENV=production` and
//! from `.env.development` otherwise. A missing key is only an error once
//! there is a line to sign.

use crabwhip::errors::StreamKeyError;
use crabwhip::StreamKeyCodec;
use std::io::{self, BufRead, Write};

const ENV_FILE_PROD: &str = ".env.production";
const ENV_FILE_DEV: &str = ".env.development";

/// Sign every line of `input` onto `output`. The codec is built on the first
/// line; the first failure ends the run.
fn sign_lines<R, W, F>(input: R, output: &mut W, make_codec: F) -> Result<usize, String>
where
    R: BufRead,
    W: Write,
    F: FnOnce() -> Result<StreamKeyCodec, StreamKeyError>,
{
    let mut make_codec = Some(make_codec);
    let mut codec: Option<StreamKeyCodec> = None;
    let mut signed = 0;

    for line in input.lines() {
        let in_key = line.map_err(|e| e.to_string())?;

        if codec.is_none() {
            let build = make_codec
                .take()
                .ok_or_else(|| "stream key codec unavailable".to_string())?;
            codec = Some(build().map_err(|e| e.to_string())?);
        }
        let Some(codec) = codec.as_ref() else {
            continue;
        };

        let whip = codec.encode_whip(&in_key).map_err(|e| e.to_string())?;
        let whep = codec.encode_whep(&in_key).map_err(|e| e.to_string())?;
        writeln!(output, "{},{},{}", in_key, whip, whep).map_err(|e| e.to_string())?;
        signed += 1;
    }
    Ok(signed)
}

fn main() {
    crabwhip::init_logging();

    let env_file = if std::env::var("APP_ENV").as_deref() == Ok("production") {
        ENV_FILE_PROD
    } else {
        ENV_FILE_DEV
    };
    if let Err(e) = dotenvy::from_filename(env_file) {
        log::debug!("Not loading {}: {}", env_file, e);
    }

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match sign_lines(stdin.lock(), &mut out, StreamKeyCodec::from_env) {
        Ok(signed) => log::debug!("Signed {} key(s)", signed),
        Err(e) => {
            let _ = writeln!(out, "error: {}", e);
            std::process::exit(1);
        }
    }
}
