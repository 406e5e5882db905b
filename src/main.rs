//! rtc-helper - Main entry point
//!
//! Runs a local loopback: one session pushes synthetic audio/video, a second
//! session in the same process pulls it, and trickled ICE is routed between
//! them through the registry. Send statistics are logged on the configured
//! interval until the duration elapses or the process is interrupted.

mod args;

use args::Args;
use clap::Parser;
use log::{error, info, warn};
use rtc_helper::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Logging level may come from the config file, so load it first
    let loaded = args.load_config();
    let config = loaded.as_ref().cloned().unwrap_or_default();

    let log_level = if args.verbose { "debug".to_string() } else { config.logging.level.clone() };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("RTC_HELPER_LOG").unwrap_or(log_level))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .filter_module("webrtc_srtp", log::LevelFilter::Error)
        .filter_module("webrtc_sctp", log::LevelFilter::Error)
        .init();

    info!("rtc-helper v{}", env!("CARGO_PKG_VERSION"));
    match &loaded {
        Ok(_) => info!("Loaded configuration from {:?}", args.config),
        Err(e) => warn!("Failed to load config: {}, using defaults", e),
    }

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    run(&args, config).await
}

#[cfg(not(feature = "webrtc-streaming"))]
async fn run(_args: &Args, _config: Config) -> Result<(), Box<dyn std::error::Error>> {
    Err(rtc_helper::WebRTCError::FeatureDisabled.into())
}

#[cfg(feature = "webrtc-streaming")]
async fn run(args: &Args, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    loopback::run(args, config).await
}

#[cfg(feature = "webrtc-streaming")]
mod loopback {
    use crate::args::{Args, Mode};
    use bytes::Bytes;
    use log::{debug, info, warn};
    use rtc_helper::engine::rtc::{write_sample, RtcEngine};
    use rtc_helper::engine::AudioSamples;
    use rtc_helper::{
        Config, EngineContext, LocalMedia, MediaEngine, MediaTrack, SessionCallbacks, SessionRegistry, TrackCache,
        WebRTCError,
    };
    use std::sync::{Arc, Weak};
    use std::time::Duration;
    use tokio::signal;
    use tokio::task::JoinHandle;

    const PUSHER: &str = "loopback-pusher";
    const PULLER: &str = "loopback-puller";

    /// Opus DTX silence frame
    const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
    const AUDIO_FRAME: Duration = Duration::from_millis(20);
    const VIDEO_FRAME: Duration = Duration::from_millis(33);

    pub async fn run(args: &Args, config: Config) -> Result<(), Box<dyn std::error::Error>> {
        let context = Arc::new(EngineContext::new());
        let engine = context.initialize(|| Ok(Arc::new(RtcEngine::new()?) as Arc<dyn MediaEngine>))?;
        if let Err(e) = engine.set_audio_sample_tap(Some(Arc::new(|samples: &AudioSamples<'_>| {
            debug!("Captured {} audio samples at {} Hz", samples.data.len(), samples.sample_rate);
        }))) {
            info!("Audio sample tap unavailable: {}", e);
        }

        let registry = Arc::new(SessionRegistry::new(context.clone(), config.session_defaults()));
        let tracks = TrackCache::new(engine.clone());
        let audio = tracks.audio("loopback-audio")?;
        let video = tracks.video("loopback-video")?;
        let feeders = [
            feed(audio.clone().into(), Bytes::from_static(&OPUS_SILENCE), AUDIO_FRAME),
            feed(video.clone().into(), Bytes::from(vec![0u8; 1200]), VIDEO_FRAME),
        ];
        let media = LocalMedia::new(Some(audio), Some(video));

        let negotiated = match args.mode {
            Mode::PushStart => push_start(&registry, media).await,
            Mode::PullStart => pull_start(&registry, media).await,
        };
        match negotiated {
            Ok(()) => {
                info!("Loopback negotiated ({:?}), streaming for {}s", args.mode, args.duration);
                report(&registry, args, Duration::from_millis(config.stats.interval_ms)).await;
            }
            Err(e) => warn!("Loopback negotiation failed: {}", e),
        }

        for feeder in feeders {
            feeder.abort();
        }
        registry.release_all();
        tracks.release();
        context.release();
        info!("Loopback finished");
        Ok(())
    }

    /// Route trickled candidates of one side into the other
    fn forward_ice(registry: &Arc<SessionRegistry>, to: &'static str) -> impl Fn(String) + Send + Sync + 'static {
        let registry: Weak<SessionRegistry> = Arc::downgrade(registry);
        move |payload| {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                registry.add_ice_candidate(to, &payload).await;
            });
        }
    }

    fn callbacks(registry: &Arc<SessionRegistry>, id: &'static str, peer: &'static str) -> SessionCallbacks {
        SessionCallbacks::new()
            .on_ice(forward_ice(registry, peer))
            .on_connected(move || info!("Session {} connected", id))
            .on_disconnect(move || info!("Session {} disconnected", id))
            .on_audio_connected(move |track| info!("Session {} receiving audio {}", id, track.id()))
            .on_video_connected(move |track| info!("Session {} receiving video {}", id, track.id()))
    }

    async fn push_start(registry: &Arc<SessionRegistry>, media: LocalMedia) -> Result<(), WebRTCError> {
        let answerer = registry.clone();
        let puller = callbacks(registry, PULLER, PUSHER);
        registry
            .start_push(PUSHER, media, callbacks(registry, PUSHER, PULLER), move |offer| async move {
                answerer.accept_pull(PULLER, &offer, puller).await
            })
            .await
    }

    async fn pull_start(registry: &Arc<SessionRegistry>, media: LocalMedia) -> Result<(), WebRTCError> {
        let answerer = registry.clone();
        let pusher = callbacks(registry, PUSHER, PULLER);
        registry
            .start_pull(PULLER, callbacks(registry, PULLER, PUSHER), move |offer| async move {
                answerer.accept_push(PUSHER, media, &offer, pusher).await
            })
            .await
    }

    fn feed(track: MediaTrack, payload: Bytes, frame: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(frame);
            loop {
                ticker.tick().await;
                if let Err(e) = write_sample(&track, payload.clone(), frame).await {
                    debug!("{}", e);
                }
            }
        })
    }

    async fn report(registry: &SessionRegistry, args: &Args, interval: Duration) {
        let deadline = tokio::time::sleep(Duration::from_secs(args.duration));
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = signal::ctrl_c() => {
                    info!("Interrupted");
                    break;
                }
                _ = ticker.tick() => {
                    if let Some(audio) = registry.audio_stats(PUSHER).await {
                        info!("{}", audio);
                    }
                    if let Some(video) = registry.video_stats(PUSHER).await {
                        info!("{}", video);
                    }
                    match registry.average_audio_level(PUSHER) {
                        Ok(level) => info!("average level: {}", level),
                        Err(e) => {
                            warn!("{}", e);
                            break;
                        }
                    }
                }
            }
        }
    }
}
