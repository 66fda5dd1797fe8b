//! Submission validation (§4.6) and `Kind::Auto` resolution (§9 supplement
//! "Kind sniffing for `auto`"). The Orchestrator owns this contract
//! regardless of which collaborator (REST, tests, …) calls `Submit`.

use url::Url;

use crate::domain::{CreateReq, Headers, Kind, Options};
use crate::error::OrchestratorError;

const ALLOWED_EXTRA_HEADERS: &[&str] = &["user-agent", "referer", "authorization", "cookie", "accept"];
const RESERVED_FILENAME_CHARS: &[char] = &['/', '\\', '\0', ':', '*', '?', '"', '<', '>', '|'];

/// Validate a submission and resolve `Kind::Auto` to a concrete kind.
/// Returns the resolved kind and the (lightly sanitized) options, or the
/// first validation failure encountered.
pub fn validate(req: &CreateReq) -> Result<(Kind, Options), OrchestratorError> {
    let url = Url::parse(&req.url).map_err(|err| OrchestratorError::InvalidInput(format!("invalid url: {err}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(OrchestratorError::InvalidInput(
            "url must use the http or https scheme".to_string(),
        ));
    }

    let kind = match req.kind {
        Kind::Auto => sniff_kind(&url),
        other => other,
    };

    let mut options = req.options.clone();
    validate_headers(&options.headers)?;

    options.filename_hint = sanitize_filename_hint(&options.filename_hint)?;

    if let Some(transcode) = &options.transcode {
        if !(1..=51).contains(&transcode.crf) {
            return Err(OrchestratorError::InvalidInput(
                "transcode.crf must be in [1, 51]".to_string(),
            ));
        }
    }

    match kind {
        Kind::Twitter => {
            let twitter = options
                .twitter
                .as_ref()
                .ok_or_else(|| OrchestratorError::InvalidInput("twitter options required for kind=twitter".to_string()))?;
            if !(1..=200).contains(&twitter.max_tweets) {
                return Err(OrchestratorError::InvalidInput(
                    "twitter.maxTweets must be in [1, 200]".to_string(),
                ));
            }
            if twitter.tweet_id.is_none() && twitter.username.is_none() {
                return Err(OrchestratorError::InvalidInput(
                    "twitter options require either tweetId or username".to_string(),
                ));
            }
        }
        Kind::Pinterest => {
            let pinterest = options.pinterest.as_ref().ok_or_else(|| {
                OrchestratorError::InvalidInput("pinterest options required for kind=pinterest".to_string())
            })?;
            if !(1..=500).contains(&pinterest.max_images) {
                return Err(OrchestratorError::InvalidInput(
                    "pinterest.maxImages must be in [1, 500]".to_string(),
                ));
            }
            if let Some(resolution) = &pinterest.resolution
                && !is_resolution_shape(resolution)
            {
                return Err(OrchestratorError::InvalidInput(
                    "pinterest.resolution must match ^\\d+x\\d+$".to_string(),
                ));
            }
        }
        _ => {}
    }

    Ok((kind, options))
}

fn validate_headers(headers: &Headers) -> Result<(), OrchestratorError> {
    for key in headers.extra.keys() {
        if !ALLOWED_EXTRA_HEADERS.contains(&key.to_lowercase().as_str()) {
            return Err(OrchestratorError::InvalidInput(format!(
                "header '{key}' is not in the allow-list"
            )));
        }
    }
    Ok(())
}

/// Strip path separators and reserved filesystem characters; an
/// empty-after-sanitization hint is rejected rather than silently dropped
/// (a caller that supplied a hint wanted it honored, or not at all).
fn sanitize_filename_hint(hint: &str) -> Result<String, OrchestratorError> {
    if hint.is_empty() {
        return Ok(String::new());
    }
    let sanitized: String = hint.chars().filter(|c| !RESERVED_FILENAME_CHARS.contains(c)).collect();
    let sanitized = sanitized.trim().to_string();
    if sanitized.is_empty() {
        return Err(OrchestratorError::InvalidInput(
            "filenameHint is empty after sanitization".to_string(),
        ));
    }
    Ok(sanitized)
}

fn is_resolution_shape(s: &str) -> bool {
    let Some((w, h)) = s.split_once('x') else {
        return false;
    };
    !w.is_empty() && !h.is_empty() && w.chars().all(|c| c.is_ascii_digit()) && h.chars().all(|c| c.is_ascii_digit())
}

/// Infer a concrete `Kind` from the URL's host/path shape. Order matters:
/// the most specific host match wins before falling back to `file`.
fn sniff_kind(url: &Url) -> Kind {
    let host = url.host_str().unwrap_or_default().to_lowercase();
    if host.ends_with("youtube.com") || host.ends_with("youtu.be") {
        return Kind::Youtube;
    }
    if host.ends_with("twitter.com") || host.ends_with("x.com") {
        return Kind::Twitter;
    }
    if host.ends_with("pinterest.com") || host.ends_with("pin.it") {
        return Kind::Pinterest;
    }
    if url.path().to_lowercase().ends_with(".m3u8") {
        return Kind::Hls;
    }
    Kind::File
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MediaType, TwitterOptions};

    fn req(url: &str, kind: Kind) -> CreateReq {
        CreateReq {
            url: url.to_string(),
            kind,
            options: Options::default(),
        }
    }

    #[test]
    fn rejects_non_http_scheme() {
        let result = validate(&req("ftp://example.test/a", Kind::File));
        assert!(matches!(result, Err(OrchestratorError::InvalidInput(_))));
    }

    #[test]
    fn sniffs_youtube_host() {
        let (kind, _) = validate(&req("https://www.youtube.com/watch?v=abc", Kind::Auto)).unwrap();
        assert_eq!(kind, Kind::Youtube);
    }

    #[test]
    fn sniffs_hls_by_extension() {
        let (kind, _) = validate(&req("https://cdn.example.test/stream/index.m3u8", Kind::Auto)).unwrap();
        assert_eq!(kind, Kind::Hls);
    }

    #[test]
    fn falls_back_to_file_kind() {
        let (kind, _) = validate(&req("https://example.test/a.bin", Kind::Auto)).unwrap();
        assert_eq!(kind, Kind::File);
    }

    #[test]
    fn rejects_disallowed_extra_header() {
        let mut request = req("https://example.test/a.bin", Kind::File);
        request.options.headers.extra.insert("x-api-key".to_string(), "secret".to_string());
        assert!(matches!(validate(&request), Err(OrchestratorError::InvalidInput(_))));
    }

    #[test]
    fn twitter_requires_max_tweets_in_range_and_a_target() {
        let mut request = req("https://x.com/some/status/1", Kind::Twitter);
        request.options.twitter = Some(TwitterOptions {
            tweet_id: None,
            username: None,
            media_type: MediaType::All,
            include_retweets: false,
            max_tweets: 10,
        });
        assert!(validate(&request).is_err());

        request.options.twitter.as_mut().unwrap().username = Some("someone".to_string());
        assert!(validate(&request).is_ok());
    }

    #[test]
    fn sanitizes_filename_hint_and_rejects_empty_result() {
        let mut request = req("https://example.test/a.bin", Kind::File);
        request.options.filename_hint = "../../etc/passwd".to_string();
        let (_, options) = validate(&request).unwrap();
        assert!(!options.filename_hint.contains('/'));

        request.options.filename_hint = "///".to_string();
        assert!(validate(&request).is_err());
    }
}
