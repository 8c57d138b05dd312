//! HTTP API of landmarker.io.
//!
//! All endpoints live under [`API_PREFIX`]. The router is built from an [`AppState`] holding the
//! stores and a [`ServerConfig`] deciding about authentication and CORS.

use std::{path::Path, sync::Arc};

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, MethodRouter},
    Router,
};
use landmarker_content::{
    cache_reader::{ImageCache, ImageUpload, MeshCache, MeshSource},
    collection::CollectionStore,
    landmark::LandmarkStore,
    template::TemplateStore,
    Mode,
};
use landmarker_shared::log::info;

pub mod auth;
pub mod config;
mod error;
pub mod routes;

pub use config::*;
pub use error::*;

pub const API_PREFIX: &str = "/api/v2";

/// Shared state of all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub mode: Mode,
    pub images: Arc<dyn ImageUpload>,
    /// Only present in [`Mode::Mesh`].
    pub meshes: Option<Arc<dyn MeshSource>>,
    pub landmarks: Arc<dyn LandmarkStore>,
    pub templates: Arc<dyn TemplateStore>,
    pub collections: Arc<dyn CollectionStore>,
}

impl AppState {
    /// Serves the images and, in [`Mode::Mesh`], the meshes of a cache directory.
    pub fn from_cache(
        mode: Mode,
        cache_dir: impl AsRef<Path>,
        landmarks: Arc<dyn LandmarkStore>,
        templates: Arc<dyn TemplateStore>,
        collections: Arc<dyn CollectionStore>,
    ) -> landmarker_content::Result<Self> {
        let cache_dir = cache_dir.as_ref();
        let meshes = match mode {
            Mode::Image => None,
            Mode::Mesh => Some(Arc::new(MeshCache::new(cache_dir)?) as Arc<dyn MeshSource>),
        };
        Ok(Self {
            mode,
            images: Arc::new(ImageCache::new(cache_dir)?),
            meshes,
            landmarks,
            templates,
            collections,
        })
    }
}

fn api_routes(mode: Mode) -> Router<AppState> {
    let images: MethodRouter<AppState> = match mode {
        Mode::Image => get(routes::images).post(routes::upload_image).layer(DefaultBodyLimit::max(MAX_UPLOAD_SIZE)),
        Mode::Mesh => get(routes::images),
    };
    let router = Router::new()
        .route("/mode", get(routes::mode))
        .route("/collections", get(routes::collections))
        .route("/collections/:collection_id", get(routes::collection))
        .route("/templates", get(routes::templates))
        .route("/templates/:template_id", get(routes::template))
        .route("/images", images)
        .route("/images/:asset_id", get(routes::image_info))
        .route("/textures/:asset_id", get(routes::texture))
        .route("/thumbnails/:asset_id", get(routes::thumbnail))
        .route("/landmarks", get(routes::landmarks))
        .route("/landmarks/:asset_id", get(routes::landmark_ids))
        .route("/landmarks/:asset_id/:landmark_id", get(routes::landmark).put(routes::save_landmark));
    match mode {
        Mode::Image => router,
        Mode::Mesh => router
            .route("/meshes", get(routes::meshes))
            .route("/meshes/:asset_id", get(routes::mesh)),
    }
}

/// Builds the complete router. CORS is the outermost layer so preflight requests are answered
/// without credentials.
pub fn build_router(state: AppState, config: &ServerConfig) -> Router {
    let mut api = api_routes(state.mode).with_state(state);
    if let Some(auth) = &config.auth {
        info!("Requests must authenticate as '{}'", auth.username);
        api = api.layer(middleware::from_fn_with_state(auth.clone(), auth::require_basic_auth));
    }
    Router::new().nest(API_PREFIX, api).layer(config.cors_layer())
}

/// Serves the router until the process is stopped.
pub async fn serve(router: Router, config: &ServerConfig) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(config.address).await?;
    info!("Serving {} mode on http://{}{API_PREFIX}", config.mode, listener.local_addr()?);
    if config.dev {
        info!("Development mode - requests from every origin are accepted");
    }
    axum::serve(listener, router).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use axum::{
        body::{to_bytes, Body},
        http::{header, Method, Request, StatusCode},
        response::Response,
    };
    use base64::{engine::general_purpose::STANDARD, Engine};
    use image::ImageFormat;
    use landmarker_content::{
        asset_paths::ScanPattern,
        cache_builder::{build_cache, CacheOptions, Concurrency},
        collection::AllCacheCollection,
        landmark::SeparateDirLandmarkStore,
        template::FileTemplateStore,
    };
    use landmarker_shared::{indoc::indoc, serde_json};
    use landmarker_test::{gradient_image, setup_logger, write_image, write_quad_obj};
    use tempdir::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::auth::BasicAuth;

    struct Fixture {
        _root: TempDir,
        router: Router,
    }

    fn fixture(mode: Mode, config: ServerConfig) -> Fixture {
        setup_logger();
        let root = TempDir::new("landmarker_server").unwrap();
        match mode {
            Mode::Image => {
                write_image(root.path().join("assets/face01.png"), 8, 6, ImageFormat::Png);
                write_image(root.path().join("assets/face02.jpg"), 8, 6, ImageFormat::Jpeg);
            }
            Mode::Mesh => {
                write_quad_obj(root.path().join("assets/quad.obj"), false);
            }
        }
        fs::create_dir_all(root.path().join("templates")).unwrap();
        fs::write(
            root.path().join("templates/face.yml"),
            indoc! {"
                groups:
                  - label: eye
                    points: 3
                    connectivity: cycle
            "},
        )
        .unwrap();

        let options = CacheOptions {
            asset_dir: root.path().join("assets"),
            cache_dir: root.path().join("cache"),
            mode,
            pattern: ScanPattern::default(),
            concurrency: Concurrency::Serial,
        };
        let (cache_dir, _, report) = build_cache(&options).unwrap();
        assert!(report.is_success());

        let state = AppState::from_cache(
            mode,
            &cache_dir,
            Arc::new(SeparateDirLandmarkStore::new(root.path().join("landmarks")).unwrap()),
            Arc::new(FileTemplateStore::new(root.path().join("templates"), mode.n_dims()).unwrap()),
            Arc::new(AllCacheCollection::new(&cache_dir).unwrap()),
        )
        .unwrap();
        let config = ServerConfig { mode, ..config };
        Fixture {
            router: build_router(state, &config),
            _root: root,
        }
    }

    async fn send(router: &Router, request: Request<Body>) -> Response {
        router.clone().oneshot(request).await.unwrap()
    }

    async fn get(router: &Router, uri: &str) -> Response {
        send(router, Request::get(uri).body(Body::empty()).unwrap()).await
    }

    async fn json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn listings() {
        let fixture = fixture(Mode::Image, ServerConfig::default());

        let mode = get(&fixture.router, "/api/v2/mode").await;
        assert_eq!(mode.status(), StatusCode::OK);
        assert_eq!(json(mode).await, serde_json::json!("image"));

        let images = get(&fixture.router, "/api/v2/images").await;
        assert_eq!(json(images).await, serde_json::json!(["face01", "face02"]));

        let collections = get(&fixture.router, "/api/v2/collections").await;
        assert_eq!(json(collections).await, serde_json::json!(["all"]));

        let all = get(&fixture.router, "/api/v2/collections/all").await;
        assert_eq!(json(all).await, serde_json::json!(["face01", "face02"]));

        let templates = get(&fixture.router, "/api/v2/templates").await;
        assert_eq!(json(templates).await, serde_json::json!(["face"]));

        // Meshes are not routed in image mode
        let meshes = get(&fixture.router, "/api/v2/meshes").await;
        assert_eq!(meshes.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn image_files() {
        let fixture = fixture(Mode::Image, ServerConfig::default());

        let info = get(&fixture.router, "/api/v2/images/face01").await;
        assert_eq!(info.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(json(info).await, serde_json::json!({"width": 8, "height": 6}));

        let texture = get(&fixture.router, "/api/v2/textures/face01").await;
        assert_eq!(texture.status(), StatusCode::OK);
        assert_eq!(texture.headers()[header::CONTENT_TYPE], "image/jpeg");

        let thumbnail = get(&fixture.router, "/api/v2/thumbnails/face02").await;
        assert_eq!(thumbnail.status(), StatusCode::OK);

        let missing = get(&fixture.router, "/api/v2/textures/face03").await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn landmarks_fall_back_to_the_template() {
        let fixture = fixture(Mode::Image, ServerConfig::default());

        // Given no saved landmarks
        let landmarks = get(&fixture.router, "/api/v2/landmarks").await;
        assert_eq!(json(landmarks).await, serde_json::json!({}));

        // When the landmarks are requested, the template skeleton is returned
        let skeleton = json(get(&fixture.router, "/api/v2/landmarks/face01/face").await).await;
        assert_eq!(skeleton["version"], 2);
        assert_eq!(skeleton["landmarks"]["points"].as_array().unwrap().len(), 3);

        // Unknown landmark ids without template are not found
        let missing = get(&fixture.router, "/api/v2/landmarks/face01/ibug68").await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn save_then_load_landmarks() {
        let fixture = fixture(Mode::Image, ServerConfig::default());
        let landmark = serde_json::json!({
            "version": 2,
            "labels": [{"label": "eye", "mask": [0]}],
            "landmarks": {"points": [[1.0, 2.0]], "connectivity": []}
        });

        // When the landmarks are saved
        let response = send(
            &fixture.router,
            Request::builder()
                .method(Method::PUT)
                .uri("/api/v2/landmarks/face01/face")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(landmark.to_string()))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await, serde_json::json!("success"));

        // Then they are listed and returned instead of the template
        let landmarks = get(&fixture.router, "/api/v2/landmarks").await;
        assert_eq!(json(landmarks).await, serde_json::json!({"face01": ["face"]}));
        let ids = get(&fixture.router, "/api/v2/landmarks/face01").await;
        assert_eq!(json(ids).await, serde_json::json!(["face"]));
        let loaded = get(&fixture.router, "/api/v2/landmarks/face01/face").await;
        assert_eq!(json(loaded).await, landmark);
    }

    #[tokio::test]
    async fn upload_image() {
        let fixture = fixture(Mode::Image, ServerConfig::default());
        let mut png = std::io::Cursor::new(Vec::new());
        gradient_image(5, 4).write_to(&mut png, ImageFormat::Png).unwrap();
        let upload = |body: Vec<u8>| {
            Request::builder()
                .method(Method::POST)
                .uri("/api/v2/images?asset_id=face01")
                .body(Body::from(body))
                .unwrap()
        };

        // The id is taken already, so a suffix is appended
        let response = send(&fixture.router, upload(png.get_ref().clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await, serde_json::json!("face01_1"));

        let images = get(&fixture.router, "/api/v2/images").await;
        assert_eq!(json(images).await, serde_json::json!(["face01", "face01_1", "face02"]));
        let info = get(&fixture.router, "/api/v2/images/face01_1").await;
        assert_eq!(json(info).await, serde_json::json!({"width": 5, "height": 4}));

        let garbage = send(&fixture.router, upload(b"not an image".to_vec())).await;
        assert_eq!(garbage.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn upload_larger_than_the_default_body_limit() {
        let fixture = fixture(Mode::Image, ServerConfig::default());
        // BMP is uncompressed, so the body is about 3 MB
        let mut bmp = std::io::Cursor::new(Vec::new());
        gradient_image(1024, 1024).write_to(&mut bmp, ImageFormat::Bmp).unwrap();
        let body = bmp.into_inner();
        assert!(body.len() > 2 * 1024 * 1024);

        let response = send(
            &fixture.router,
            Request::builder()
                .method(Method::POST)
                .uri("/api/v2/images?asset_id=photo")
                .body(Body::from(body))
                .unwrap(),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await, serde_json::json!("photo"));
        let info = get(&fixture.router, "/api/v2/images/photo").await;
        assert_eq!(json(info).await, serde_json::json!({"width": 1024, "height": 1024}));
    }

    #[tokio::test]
    async fn meshes_are_gzip_encoded() {
        let fixture = fixture(Mode::Mesh, ServerConfig::default());

        let meshes = get(&fixture.router, "/api/v2/meshes").await;
        assert_eq!(json(meshes).await, serde_json::json!(["quad"]));

        let mesh = get(&fixture.router, "/api/v2/meshes/quad").await;
        assert_eq!(mesh.status(), StatusCode::OK);
        assert_eq!(mesh.headers()[header::CONTENT_ENCODING], "gzip");

        let missing = get(&fixture.router, "/api/v2/meshes/cube").await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn basic_auth() {
        let config = ServerConfig {
            auth: Some(Arc::new(BasicAuth::from_password("alice", "secret", "salt"))),
            ..ServerConfig::default()
        };
        let fixture = fixture(Mode::Image, config);
        let with_credentials = |credentials: &str| {
            Request::get("/api/v2/mode")
                .header(header::AUTHORIZATION, format!("Basic {}", STANDARD.encode(credentials)))
                .body(Body::empty())
                .unwrap()
        };

        let anonymous = get(&fixture.router, "/api/v2/mode").await;
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            anonymous.headers()[header::WWW_AUTHENTICATE],
            "Basic realm=\"Authentication Required\""
        );

        let wrong = send(&fixture.router, with_credentials("alice:guess")).await;
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let authorized = send(&fixture.router, with_credentials("alice:secret")).await;
        assert_eq!(authorized.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cors_allows_the_hosted_client() {
        let fixture = fixture(Mode::Image, ServerConfig::default());
        let request = Request::get("/api/v2/mode")
            .header(header::ORIGIN, LANDMARKER_ORIGIN)
            .body(Body::empty())
            .unwrap();

        let response = send(&fixture.router, request).await;

        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], LANDMARKER_ORIGIN);
    }

    #[tokio::test]
    async fn dev_mode_allows_every_origin() {
        let config = ServerConfig {
            dev: true,
            ..ServerConfig::default()
        };
        let fixture = fixture(Mode::Image, config);
        let request = Request::get("/api/v2/mode")
            .header(header::ORIGIN, "http://localhost:4000")
            .body(Body::empty())
            .unwrap();

        let response = send(&fixture.router, request).await;

        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }
}
