//! Transport-agnostic operations behind the player and admin endpoints.
//!
//! Each collaborator sits behind a small trait so an HTTP, RPC or CLI front
//! end can drive [`Subbed`] with the default implementations or with fakes.

use std::future::Future;

use serde::Serialize;

use crate::catalog::{CatalogStore, NewSubtitle, Subtitle, Video, VideoWithSubtitles};
use crate::context::OpContext;
use crate::error::{CatalogResult, ServiceError};
use crate::resolver;
use crate::subtitle::{self, CANONICAL_FORMAT, SubtitleFormat};

/// Storage operations the service needs from the catalog.
pub trait VideoCatalog: Send + Sync {
    fn find_video_by_key(
        &self,
        ctx: &OpContext,
        key: &str,
    ) -> impl Future<Output = CatalogResult<Option<Video>>> + Send;

    fn list_subtitles_for_video(
        &self,
        ctx: &OpContext,
        video_id: i64,
    ) -> impl Future<Output = CatalogResult<Vec<Subtitle>>> + Send;

    fn list_videos_with_subtitles(
        &self,
        ctx: &OpContext,
    ) -> impl Future<Output = CatalogResult<Vec<VideoWithSubtitles>>> + Send;

    fn create_video(
        &self,
        ctx: &OpContext,
        url: &str,
        title: &str,
    ) -> impl Future<Output = CatalogResult<i64>> + Send;

    fn delete_video(&self, ctx: &OpContext, id: i64) -> impl Future<Output = CatalogResult<()>> + Send;

    fn create_subtitle(
        &self,
        ctx: &OpContext,
        subtitle: NewSubtitle,
    ) -> impl Future<Output = CatalogResult<i64>> + Send;

    fn delete_subtitle(
        &self,
        ctx: &OpContext,
        id: i64,
    ) -> impl Future<Output = CatalogResult<()>> + Send;
}

impl VideoCatalog for CatalogStore {
    fn find_video_by_key(
        &self,
        ctx: &OpContext,
        key: &str,
    ) -> impl Future<Output = CatalogResult<Option<Video>>> + Send {
        CatalogStore::find_video_by_key(self, ctx, key)
    }

    fn list_subtitles_for_video(
        &self,
        ctx: &OpContext,
        video_id: i64,
    ) -> impl Future<Output = CatalogResult<Vec<Subtitle>>> + Send {
        CatalogStore::list_subtitles_for_video(self, ctx, video_id)
    }

    fn list_videos_with_subtitles(
        &self,
        ctx: &OpContext,
    ) -> impl Future<Output = CatalogResult<Vec<VideoWithSubtitles>>> + Send {
        CatalogStore::list_videos_with_subtitles(self, ctx)
    }

    fn create_video(
        &self,
        ctx: &OpContext,
        url: &str,
        title: &str,
    ) -> impl Future<Output = CatalogResult<i64>> + Send {
        CatalogStore::create_video(self, ctx, url, title)
    }

    fn delete_video(&self, ctx: &OpContext, id: i64) -> impl Future<Output = CatalogResult<()>> + Send {
        CatalogStore::delete_video(self, ctx, id)
    }

    fn create_subtitle(
        &self,
        ctx: &OpContext,
        subtitle: NewSubtitle,
    ) -> impl Future<Output = CatalogResult<i64>> + Send {
        CatalogStore::create_subtitle(self, ctx, subtitle)
    }

    fn delete_subtitle(
        &self,
        ctx: &OpContext,
        id: i64,
    ) -> impl Future<Output = CatalogResult<()>> + Send {
        CatalogStore::delete_subtitle(self, ctx, id)
    }
}

pub trait SubtitleNormalizer: Send + Sync {
    fn normalize(&self, input: &str, declared: SubtitleFormat) -> String;

    /// The format every normalized document is in.
    fn canonical_format(&self) -> SubtitleFormat {
        CANONICAL_FORMAT
    }
}

/// WebVTT to SRT, see [`subtitle::normalize`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardNormalizer;

impl SubtitleNormalizer for StandardNormalizer {
    fn normalize(&self, input: &str, declared: SubtitleFormat) -> String {
        subtitle::normalize(input, declared)
    }
}

pub trait KeyResolver: Send + Sync {
    fn key_from_url(&self, url: &str) -> Option<String>;

    fn url_from_path(&self, path: &str) -> Option<String>;

    fn key_from_path(&self, path: &str) -> Option<String> {
        self.url_from_path(path)
            .and_then(|url| self.key_from_url(&url))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct YouTubeResolver;

impl KeyResolver for YouTubeResolver {
    fn key_from_url(&self, url: &str) -> Option<String> {
        resolver::video_key_from_url(url)
    }

    fn url_from_path(&self, path: &str) -> Option<String> {
        resolver::url_from_path(path)
    }
}

/// Player response: the video (with `original_url` replaced by the resolved
/// key) and its full subtitle tracks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VideoDetail {
    pub video: Video,
    pub subtitles: Vec<Subtitle>,
}

/// Outcome of registering a video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedVideo {
    pub id: i64,
    pub video_key: Option<String>,
}

/// An admin upload before normalization. `language` is free text.
#[derive(Debug, Clone)]
pub struct SubtitleUpload {
    pub video_id: i64,
    pub language: String,
    pub declared_format: SubtitleFormat,
    pub content: String,
}

/// The application core: catalog, normalizer and resolver wired together.
#[derive(Debug, Clone)]
pub struct Subbed<C, N = StandardNormalizer, R = YouTubeResolver> {
    catalog: C,
    normalizer: N,
    resolver: R,
}

impl<C: VideoCatalog> Subbed<C> {
    pub fn new(catalog: C) -> Self {
        Self::with_parts(catalog, StandardNormalizer, YouTubeResolver)
    }
}

impl<C, N, R> Subbed<C, N, R>
where
    C: VideoCatalog,
    N: SubtitleNormalizer,
    R: KeyResolver,
{
    pub fn with_parts(catalog: C, normalizer: N, resolver: R) -> Self {
        Self {
            catalog,
            normalizer,
            resolver,
        }
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    /// Looks up the video behind a raw player URL.
    pub async fn video_detail(
        &self,
        ctx: &OpContext,
        raw_url: &str,
    ) -> Result<VideoDetail, ServiceError> {
        let key = self
            .resolver
            .key_from_url(raw_url)
            .ok_or_else(|| ServiceError::InvalidInput("Invalid YouTube URL".into()))?;

        let video = self
            .catalog
            .find_video_by_key(ctx, &key)
            .await?
            .ok_or(ServiceError::NotFound)?;
        let subtitles = self.catalog.list_subtitles_for_video(ctx, video.id).await?;

        Ok(VideoDetail {
            video: Video {
                id: video.id,
                original_url: key,
                title: video.title,
            },
            subtitles,
        })
    }

    pub async fn admin_listing(
        &self,
        ctx: &OpContext,
    ) -> Result<Vec<VideoWithSubtitles>, ServiceError> {
        Ok(self.catalog.list_videos_with_subtitles(ctx).await?)
    }

    /// Registers a video. Both `url` and `title` must be non-blank; the URL is
    /// stored exactly as given.
    ///
    /// The result carries the resolved player key, `None` when the URL has no
    /// recognizable video id and the player will never find it.
    pub async fn create_video(
        &self,
        ctx: &OpContext,
        url: &str,
        title: &str,
    ) -> Result<CreatedVideo, ServiceError> {
        if url.trim().is_empty() || title.trim().is_empty() {
            return Err(ServiceError::InvalidInput("url and title are required".into()));
        }
        let id = self.catalog.create_video(ctx, url, title).await?;
        Ok(CreatedVideo {
            id,
            video_key: self.resolver.key_from_url(url),
        })
    }

    pub async fn delete_video(&self, ctx: &OpContext, id: i64) -> Result<(), ServiceError> {
        Ok(self.catalog.delete_video(ctx, id).await?)
    }

    /// Normalizes an uploaded track and stores it in the canonical format,
    /// whatever format it was uploaded in.
    pub async fn upload_subtitle(
        &self,
        ctx: &OpContext,
        upload: SubtitleUpload,
    ) -> Result<i64, ServiceError> {
        let content = self
            .normalizer
            .normalize(&upload.content, upload.declared_format);
        let subtitle = NewSubtitle {
            video_id: upload.video_id,
            language: upload.language,
            format: self.normalizer.canonical_format(),
            content,
        };
        Ok(self.catalog.create_subtitle(ctx, subtitle).await?)
    }

    pub async fn delete_subtitle(&self, ctx: &OpContext, id: i64) -> Result<(), ServiceError> {
        Ok(self.catalog.delete_subtitle(ctx, id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CatalogError;
    use anyhow::Result;
    use tempfile::{TempDir, tempdir};

    fn service() -> (TempDir, Subbed<CatalogStore>) {
        let dir = tempdir().unwrap();
        let store = CatalogStore::open(dir.path().join("subbed.db")).unwrap();
        (dir, Subbed::new(store))
    }

    #[tokio::test]
    async fn detail_reports_the_key_not_the_stored_url() -> Result<()> {
        let (_dir, svc) = service();
        let ctx = OpContext::new();
        let id = svc
            .create_video(&ctx, "https://www.youtube.com/watch?v=abc123&t=5", "Talk")
            .await?
            .id;

        let detail = svc.video_detail(&ctx, "https://youtu.be/abc123").await?;
        assert_eq!(detail.video.id, id);
        assert_eq!(detail.video.original_url, "abc123");
        assert_eq!(detail.video.title, "Talk");
        assert!(detail.subtitles.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn detail_distinguishes_bad_urls_from_unknown_videos() {
        let (_dir, svc) = service();
        let ctx = OpContext::new();
        assert!(matches!(
            svc.video_detail(&ctx, "https://example.com/x").await,
            Err(ServiceError::InvalidInput(_))
        ));
        assert!(matches!(
            svc.video_detail(&ctx, "https://youtu.be/unknown").await,
            Err(ServiceError::NotFound)
        ));
    }

    #[tokio::test]
    async fn blank_fields_are_rejected_before_storage() {
        let (_dir, svc) = service();
        let ctx = OpContext::new();
        assert!(matches!(
            svc.create_video(&ctx, "  ", "title").await,
            Err(ServiceError::InvalidInput(_))
        ));
        assert!(matches!(
            svc.create_video(&ctx, "https://youtu.be/a", "").await,
            Err(ServiceError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_registration_surfaces_conflict() -> Result<()> {
        let (_dir, svc) = service();
        let ctx = OpContext::new();
        svc.create_video(&ctx, "https://youtu.be/a", "one").await?;
        let err = svc
            .create_video(&ctx, "https://youtu.be/a", "two")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Catalog(CatalogError::Conflict(_))));
        Ok(())
    }

    #[tokio::test]
    async fn vtt_upload_is_stored_as_srt() -> Result<()> {
        let (_dir, svc) = service();
        let ctx = OpContext::new();
        let video_id = svc.create_video(&ctx, "https://youtu.be/vtt", "t").await?.id;
        svc.upload_subtitle(
            &ctx,
            SubtitleUpload {
                video_id,
                language: "en".into(),
                declared_format: SubtitleFormat::WebVtt,
                content: "WEBVTT\n\n00:00:01.500 --> 00:00:02.000\nHello.\n".into(),
            },
        )
        .await?;

        let detail = svc.video_detail(&ctx, "https://youtu.be/vtt").await?;
        assert_eq!(detail.subtitles.len(), 1);
        let track = &detail.subtitles[0];
        assert_eq!(track.format, "srt");
        assert_eq!(
            track.content.as_deref(),
            Some("1\n00:00:01,500 --> 00:00:02,000\nHello.\n")
        );
        Ok(())
    }

    #[tokio::test]
    async fn url_is_stored_exactly_as_given() -> Result<()> {
        let (_dir, svc) = service();
        let ctx = OpContext::new();
        let url = " https://youtu.be/spaced ";
        let created = svc.create_video(&ctx, url, "t").await?;
        assert_eq!(created.video_key.as_deref(), Some("spaced"));

        let listing = svc.admin_listing(&ctx).await?;
        assert_eq!(listing[0].video.original_url, url);
        Ok(())
    }

    #[tokio::test]
    async fn unkeyed_url_is_reported_to_the_caller() -> Result<()> {
        let (_dir, svc) = service();
        let created = svc
            .create_video(&OpContext::new(), "https://www.youtube.com/shorts/abc", "t")
            .await?;
        assert_eq!(created.video_key, None);
        Ok(())
    }

    #[tokio::test]
    async fn empty_language_is_accepted() -> Result<()> {
        let (_dir, svc) = service();
        let ctx = OpContext::new();
        let video_id = svc.create_video(&ctx, "https://youtu.be/lang", "t").await?.id;
        svc.upload_subtitle(
            &ctx,
            SubtitleUpload {
                video_id,
                language: String::new(),
                declared_format: SubtitleFormat::Srt,
                content: "1\n00:00:01,000 --> 00:00:02,000\nx\n".into(),
            },
        )
        .await?;

        let detail = svc.video_detail(&ctx, "https://youtu.be/lang").await?;
        assert_eq!(detail.subtitles[0].language, "");
        Ok(())
    }

    #[tokio::test]
    async fn upload_to_missing_video_fails() {
        let (_dir, svc) = service();
        let err = svc
            .upload_subtitle(
                &OpContext::new(),
                SubtitleUpload {
                    video_id: 5,
                    language: "en".into(),
                    declared_format: SubtitleFormat::Srt,
                    content: String::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Catalog(CatalogError::MissingVideo(5))
        ));
    }

    #[test]
    fn resolver_composes_path_and_url() {
        let resolver = YouTubeResolver;
        assert_eq!(
            resolver.key_from_path("/https:/youtu.be/abc123").as_deref(),
            Some("abc123")
        );
        assert_eq!(resolver.key_from_path("/index.html"), None);
    }
}
