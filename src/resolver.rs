//! Extraction of YouTube video ids from the URL shapes the player receives.

use url::Url;

const WATCH_DOMAIN: &str = "youtube.com";
const SHORT_LINK_DOMAIN: &str = "youtu.be";
const SCHEME_MARKER: &str = "http";

/// Returns the video id carried by a YouTube URL.
///
/// `youtube.com` (any subdomain, including `www.`) reads the `v` query
/// parameter; `youtu.be` reads the path. Every other host yields `None`.
pub fn video_key_from_url(raw: &str) -> Option<String> {
    let parsed = Url::parse(raw).ok()?;
    let host = parsed.host_str()?;

    if host.contains(WATCH_DOMAIN) {
        parsed
            .query_pairs()
            .find(|(name, _)| name == "v")
            .map(|(_, value)| value.into_owned())
            .filter(|key| !key.is_empty())
    } else if host.contains(SHORT_LINK_DOMAIN) {
        let path = parsed.path();
        let key = path.strip_prefix('/').unwrap_or(path);
        (!key.is_empty()).then(|| key.to_owned())
    } else {
        None
    }
}

/// Recovers a full URL that was appended to this service's own path, e.g.
/// `/https:/youtu.be/abc`.
///
/// Proxies and browsers tend to squash `//` into `/`, so a collapsed
/// `https:/` or `http:/` scheme separator is repaired. The result is not
/// validated; feed it to [`video_key_from_url`] for that.
pub fn url_from_path(path: &str) -> Option<String> {
    let start = path.find(SCHEME_MARKER)?;
    let candidate = &path[start..];

    let repaired = if let Some(rest) = collapsed_scheme(candidate, "https:") {
        format!("https://{rest}")
    } else if let Some(rest) = collapsed_scheme(candidate, "http:") {
        format!("http://{rest}")
    } else {
        candidate.to_owned()
    };

    Some(repaired)
}

/// Composes [`url_from_path`] and [`video_key_from_url`].
pub fn video_key_from_path(path: &str) -> Option<String> {
    url_from_path(path).and_then(|url| video_key_from_url(&url))
}

// `scheme:/rest` but not `scheme://rest`.
fn collapsed_scheme<'a>(candidate: &'a str, scheme: &str) -> Option<&'a str> {
    let after = candidate.strip_prefix(scheme)?;
    if after.starts_with("//") {
        return None;
    }
    after.strip_prefix('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_url_yields_query_parameter() {
        assert_eq!(
            video_key_from_url("https://www.youtube.com/watch?v=abc123").as_deref(),
            Some("abc123")
        );
        assert_eq!(
            video_key_from_url("https://youtube.com/watch?list=PL1&v=xyz&t=42").as_deref(),
            Some("xyz")
        );
        assert_eq!(
            video_key_from_url("https://m.youtube.com/watch?v=mobile").as_deref(),
            Some("mobile")
        );
    }

    #[test]
    fn watch_url_without_id_is_not_found() {
        assert_eq!(video_key_from_url("https://www.youtube.com/watch"), None);
        assert_eq!(video_key_from_url("https://www.youtube.com/watch?v="), None);
    }

    #[test]
    fn short_link_yields_path() {
        assert_eq!(
            video_key_from_url("https://youtu.be/abc123").as_deref(),
            Some("abc123")
        );
        assert_eq!(
            video_key_from_url("https://youtu.be/abc123?t=10").as_deref(),
            Some("abc123")
        );
        assert_eq!(video_key_from_url("https://youtu.be/"), None);
        assert_eq!(video_key_from_url("https://youtu.be"), None);
    }

    #[test]
    fn unrelated_or_unparsable_input_is_not_found() {
        assert_eq!(video_key_from_url("https://example.com/x"), None);
        assert_eq!(video_key_from_url("https://example.com/watch?v=abc"), None);
        assert_eq!(video_key_from_url("youtube.com/watch?v=abc"), None);
        assert_eq!(video_key_from_url(""), None);
    }

    #[test]
    fn collapsed_scheme_is_repaired() {
        assert_eq!(
            url_from_path("/https:/youtu.be/abc123").as_deref(),
            Some("https://youtu.be/abc123")
        );
        assert_eq!(
            url_from_path("/http:/www.youtube.com/watch?v=a").as_deref(),
            Some("http://www.youtube.com/watch?v=a")
        );
    }

    #[test]
    fn intact_scheme_is_kept() {
        assert_eq!(
            url_from_path("/https://youtu.be/abc123").as_deref(),
            Some("https://youtu.be/abc123")
        );
    }

    #[test]
    fn path_without_marker_is_not_found() {
        assert_eq!(url_from_path("/static/app.js"), None);
        assert_eq!(url_from_path(""), None);
    }

    #[test]
    fn marker_found_but_not_a_url_is_still_returned() {
        assert_eq!(url_from_path("/httpfoo").as_deref(), Some("httpfoo"));
        assert_eq!(video_key_from_path("/httpfoo"), None);
    }

    #[test]
    fn path_resolves_end_to_end() {
        assert_eq!(
            video_key_from_path("/https:/www.youtube.com/watch?v=dQw4w9WgXcQ").as_deref(),
            Some("dQw4w9WgXcQ")
        );
    }
}
