//! Interactive text console against a full dialogue engine.
//!
//! The console stands in for the robot's sensors: typed lines play the role
//! of transcribed audio, and a deterministic pseudo-face keyed on the
//! operator's name keeps the identity resolver fed so the whole pipeline
//! (recognition, classification, dispatch, enrichment) runs exactly as it
//! would on the robot.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use colored::Colorize;
use tokio::sync::mpsc;
use tracing::warn;

use parley_memory::graph::ConversationGraph;
use parley_middleware::media::{FrameRing, MediaError, MediaService, ResponseChunk, TurnRequest};
use parley_middleware::secondary::LookupRegistry;
use parley_perception::pose::{FaceLandmarks, Landmark};
use parley_perception::resolver::{BoundingBox, FaceEmbedder, FaceObservation, ResolverConfig};
use parley_perception::{Frame, PerceptionError};
use parley_runtime::capability::ImageDescriber;
use parley_runtime::llm::{
    ChatProvider, FallbackProvider, LlmError, OpenAiCompatEmbedder, OpenAiCompatProvider,
    TextEmbedder,
};
use parley_runtime::session::{EngineConfig, EngineServices, SessionEngine};
use parley_types::FragmentMode;

use crate::config::Config;

// ─────────────────────────────────────────────────────────────────────────────
// Console stand-ins for the robot's sensor services
// ─────────────────────────────────────────────────────────────────────────────

/// Typed lines are already text; "transcription" is a UTF-8 decode.
struct ConsoleMedia;

#[async_trait]
impl MediaService for ConsoleMedia {
    async fn transcribe(&self, audio: &[u8]) -> Result<String, MediaError> {
        Ok(String::from_utf8_lossy(audio).to_string())
    }

    async fn decode_frame(&self, _image: &[u8]) -> Result<Frame, MediaError> {
        Err(MediaError::Decode(
            "the console has no camera to decode images from".to_string(),
        ))
    }
}

/// Always reports one frontal face whose embedding is derived from the
/// operator's name, so the same name resolves to the same `face_N` identity
/// across sessions.
struct ConsoleFace {
    embedding: Vec<f32>,
}

impl ConsoleFace {
    fn for_operator(name: &str) -> Self {
        Self {
            embedding: pseudo_embedding(name),
        }
    }
}

/// FNV-style hash of the name, spread over 16 dimensions.
fn pseudo_embedding(name: &str) -> Vec<f32> {
    let mut state: u64 = 0xcbf2_9ce4_8422_2325;
    let mut out = Vec::with_capacity(16);
    for i in 0..16u64 {
        for b in name.to_lowercase().bytes() {
            state ^= b as u64 ^ i;
            state = state.wrapping_mul(0x0000_0100_0000_01b3);
        }
        out.push(((state % 2000) as f32 - 1000.0) / 1000.0);
    }
    out
}

impl FaceEmbedder for ConsoleFace {
    fn detect(&self, _frame: &Frame) -> Result<Option<FaceObservation>, PerceptionError> {
        let lm = |x: f32, y: f32| Landmark { x, y };
        Ok(Some(FaceObservation {
            embedding: self.embedding.clone(),
            bbox: BoundingBox {
                x: 250.0,
                y: 150.0,
                width: 100.0,
                height: 150.0,
            },
            landmarks: FaceLandmarks {
                right_eye: lm(290.0, 200.0),
                left_eye: lm(350.0, 200.0),
                nose_tip: lm(320.0, 240.0),
                right_mouth: lm(295.0, 280.0),
                left_mouth: lm(345.0, 280.0),
            },
        }))
    }
}

/// Vision turns cannot be served from a keyboard.
struct ConsoleDescriber;

#[async_trait]
impl ImageDescriber for ConsoleDescriber {
    async fn describe(&self, _frame: &Frame, _utterance: &str) -> Result<String, LlmError> {
        Err(LlmError::BadResponse(
            "no camera is attached to the console".to_string(),
        ))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine assembly
// ─────────────────────────────────────────────────────────────────────────────

fn build_provider(cfg: &Config) -> Arc<dyn ChatProvider> {
    let deadline = Duration::from_secs(cfg.provider_timeout_secs);
    let mut primary = OpenAiCompatProvider::new(cfg.provider_url.clone(), cfg.active_model.clone())
        .with_timeout(deadline);
    if !cfg.api_key.is_empty() {
        primary = primary.with_api_key(cfg.api_key.clone());
    }
    if cfg.fallback_url.is_empty() {
        return Arc::new(primary);
    }
    let mut fallback =
        OpenAiCompatProvider::new(cfg.fallback_url.clone(), cfg.fallback_model.clone())
            .with_timeout(deadline);
    if !cfg.fallback_api_key.is_empty() {
        fallback = fallback.with_api_key(cfg.fallback_api_key.clone());
    }
    Arc::new(FallbackProvider::new(Arc::new(primary), Arc::new(fallback)))
}

fn build_embedder(cfg: &Config) -> Option<Arc<dyn TextEmbedder>> {
    if cfg.embeddings_model.is_empty() {
        return None;
    }
    let mut embedder =
        OpenAiCompatEmbedder::new(cfg.provider_url.clone(), cfg.embeddings_model.clone())
            .with_timeout(Duration::from_secs(cfg.provider_timeout_secs));
    if !cfg.api_key.is_empty() {
        embedder = embedder.with_api_key(cfg.api_key.clone());
    }
    Some(Arc::new(embedder))
}

fn build_engine(cfg: &Config, operator: &str) -> Result<SessionEngine, String> {
    let db_path = cfg.resolved_db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
    }
    let graph = ConversationGraph::open(&db_path.to_string_lossy())
        .map_err(|e| format!("Failed to open memory at {}: {}", db_path.display(), e))?;

    let services = EngineServices {
        graph: Arc::new(graph),
        media: Arc::new(ConsoleMedia),
        face_embedder: Arc::new(ConsoleFace::for_operator(operator)),
        pose_classifier: None,
        provider: build_provider(cfg),
        embedder: build_embedder(cfg),
        describer: Arc::new(ConsoleDescriber),
        lookups: Arc::new(LookupRegistry::new()),
    };
    let engine_config = EngineConfig {
        recency_k: cfg.recency_k,
        similar_m: cfg.similar_m,
        name_threshold: cfg.name_threshold,
        resolver: ResolverConfig {
            recognition_threshold: cfg.recognition_threshold,
            min_face_area: cfg.min_face_area,
            max_yaw_deg: cfg.max_yaw_deg,
            ..ResolverConfig::default()
        },
        ..EngineConfig::default()
    };
    SessionEngine::new(services, engine_config).map_err(|e| format!("Engine start failed: {}", e))
}

// ─────────────────────────────────────────────────────────────────────────────
// Console loop
// ─────────────────────────────────────────────────────────────────────────────

/// Run the console until the operator types `exit` / `quit` or hits Ctrl-C.
pub async fn run(cfg: Config, operator: String, shutdown: Arc<AtomicBool>) -> Result<(), String> {
    let engine = build_engine(&cfg, &operator)?;

    // Seed the recognition window through the camera ring so the first turn
    // already resolves the operator instead of falling through to bad-input.
    let camera = FrameRing::default();
    for _ in 0..ResolverConfig::default().vote_span {
        camera.push(Frame::new(vec![0], 640, 480)).await;
    }
    for frame in camera.flush().await {
        engine.observe_frame(frame).await;
    }

    let stdin = std::io::stdin();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        use std::io::Write;
        print!("{}", "you> ".bold().green());
        std::io::stdout().flush().ok();

        let mut line = String::new();
        match stdin.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                break;
            }
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }

        let (tx, rx) = mpsc::channel::<ResponseChunk>(32);
        let printer = tokio::spawn(print_chunks(rx));
        let result = engine
            .handle_turn(TurnRequest::audio_only(line.as_bytes().to_vec()), &tx)
            .await;
        drop(tx);
        if let Err(e) = printer.await {
            warn!(error = %e, "printer task panicked");
        }
        if let Err(e) = result {
            println!("{}: {}", "turn failed".red(), e);
        }
    }

    println!("{}", "  Goodbye.".dimmed());
    engine.shutdown().await;
    Ok(())
}

async fn print_chunks(mut rx: mpsc::Receiver<ResponseChunk>) {
    use std::io::Write;
    while let Some(chunk) = rx.recv().await {
        if chunk.is_final {
            break;
        }
        match chunk.mode {
            FragmentMode::Default => {
                print!("{}", chunk.text);
                std::io::stdout().flush().ok();
            }
            FragmentMode::Error => {
                println!("{} {}", "!".red().bold(), chunk.text.red());
            }
            mode => {
                println!("{} {}", format!("[{}]", mode.as_str()).cyan(), chunk.text);
            }
        }
    }
    println!();
}
