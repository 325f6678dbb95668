use anyhow::Result;
use std::sync::Arc;
use storyreel::core::config::Config;
use storyreel::core::io::{NativeStorage, Storage};
use storyreel::core::store::{JsonStoryStore, StoryStore};
use storyreel::services::image::create_image_client;
use storyreel::services::llm::create_llm;
use storyreel::services::setup;
use storyreel::services::tts::create_tts_client;
use storyreel::services::video::FfmpegEncoder;
use storyreel::services::workflow::StoryPipeline;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let mut config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {:#}", e);
            eprintln!("Please ensure 'config.yml' exists with llm and image provider settings.");
            return Err(e);
        }
    };

    config.ensure_directories()?;

    // Credentials are checked here so a missing key fails before any work starts.
    let llm = create_llm(&config.llm)?;
    let images = create_image_client(&config.image.provider)?;
    let tts = create_tts_client(&config.audio.provider)?;

    setup::run_setup(&mut config, tts.as_ref()).await?;

    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());
    let store: Arc<dyn StoryStore> = Arc::new(JsonStoryStore::new(&config.build_folder, storage.clone()));
    let encoder = Box::new(FfmpegEncoder::new(config.video.clone()));

    let pipeline = StoryPipeline::new(config, llm, images, tts, encoder, storage, store);

    let cancel = pipeline.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Stopping after the current scene...");
            cancel.cancel();
        }
    });

    pipeline.run().await
}
