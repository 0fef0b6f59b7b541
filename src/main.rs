use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::RecvTimeoutError;
use opencv::prelude::*;
use tracing::{info, warn};

use planar_vslam::frame::builder::{FrameBuilder, OrbExtractor};
use planar_vslam::io::{Settings, TumDataset};
use planar_vslam::map::shared_map;
use planar_vslam::mapping::{LocalMapping, QueuedLocalMapper};
use planar_vslam::system::RgbdSlam;
use planar_vslam::tracking::{Tracker, TrackingState};
use planar_vslam::vocabulary::{KeyFrameDatabase, OrbVocabulary};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let settings_path = args.next().context(
        "usage: planar-vslam <settings.yaml> <dataset_dir> <associations_file> [vocabulary.txt]",
    )?;
    let dataset_path = args.next().context("missing dataset directory")?;
    let associations = args.next().context("missing associations file")?;
    let vocabulary_path = args.next();

    let settings = Settings::load(&settings_path)?;
    let dataset = TumDataset::new(&dataset_path, &associations)?;
    info!(frames = dataset.len(), "loaded dataset");

    let vocabulary = match vocabulary_path {
        Some(path) => Arc::new(OrbVocabulary::load_from_text(&path)?),
        None => {
            warn!("no vocabulary given, using a degenerate flat vocabulary");
            Arc::new(OrbVocabulary::from_words(Vec::new()))
        }
    };

    // Probe the first frame for the image dimensions.
    let first = dataset.frame(0)?;
    let camera = settings.camera_model(first.rgb.cols() as u32, first.rgb.rows() as u32);

    let extractor = OrbExtractor::new(
        settings.orb_n_features,
        settings.orb_scale_factor,
        settings.orb_n_levels,
        settings.orb_ini_th_fast,
    )?;
    let builder = FrameBuilder::new(
        camera,
        Box::new(extractor),
        settings.rgb,
        settings.depth_map_factor,
        settings.th_depth_meters(),
    );

    let map = shared_map();
    let keyframe_db = Arc::new(KeyFrameDatabase::new());
    let (mapper, kf_receiver) = QueuedLocalMapper::new(3);

    // Stand-in mapping loop: drains the keyframe queue and keeps the
    // flow-control flag honest. The real mapper (triangulation, culling,
    // local BA) is a separate collaborator.
    let mapper_thread = {
        let mapper = Arc::clone(&mapper);
        std::thread::spawn(move || loop {
            if mapper.is_shutdown_requested() {
                break;
            }
            mapper.set_accept_keyframes(kf_receiver.len() < 2);
            if mapper.take_reset_request() {
                while kf_receiver.try_recv().is_ok() {}
            }
            match kf_receiver.recv_timeout(Duration::from_millis(100)) {
                Ok(_kf_id) => {}
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        })
    };

    let tracker = Tracker::new(
        Arc::clone(&map),
        Arc::clone(&mapper) as Arc<dyn LocalMapping>,
        vocabulary,
        keyframe_db,
        settings.tracker_config(),
    );
    let mut slam = RgbdSlam::new(builder, tracker);

    let mut lost_frames = 0usize;
    for i in 0..dataset.len() {
        let pair = dataset.frame(i)?;
        let pose = slam.grab_image(&pair.rgb, &pair.depth, pair.timestamp)?;

        if slam.state() == TrackingState::Lost {
            lost_frames += 1;
        }
        if i % 100 == 0 {
            let map = map.read();
            info!(
                frame = i,
                total = dataset.len(),
                keyframes = map.num_keyframes(),
                points = map.num_map_points(),
                planes = map.num_map_planes(),
                state = ?slam.state(),
                t = ?pose.translation.as_slice(),
                "progress"
            );
        }
    }

    info!(
        frames = dataset.len(),
        lost = lost_frames,
        "finished processing"
    );

    slam.tracker()
        .trajectory()
        .save("CameraTrajectory.txt", &map.read())?;

    mapper.request_shutdown();
    mapper_thread.join().ok();
    Ok(())
}
