use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use geo::{polygon, Area, BoundingRect, MultiPolygon, Polygon, Rect};
use ndarray::Array2;
use pretty_assertions::assert_eq;

use super::*;

fn indexed_raster() -> Arc<MemoryRaster<f64>> {
    let values = Array2::from_shape_fn((10, 10), |(row, col)| (row * 10 + col) as f64);
    Arc::new(MemoryRaster::new(0., 0., 1., 1., vec![values]).unwrap())
}

fn constant_raster(size: usize, value: f64) -> Arc<MemoryRaster<f64>> {
    let values = Array2::from_elem((size, size), value);
    Arc::new(MemoryRaster::new(0., 0., 1., 1., vec![values]).unwrap())
}

fn square(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> Polygon<f64> {
    Rect::new((x_min, y_min), (x_max, y_max)).to_polygon()
}

fn assert_close(left: f64, right: f64) {
    assert!((left - right).abs() < 1e-9, "{left} != {right}");
}

#[test]
fn partially_covered_cells() -> anyhow::Result<()> {
    let pixelized = PixelizeTask::new(indexed_raster(), 1, square(0.6, 0.6, 2.6, 2.6))
        .workers(3)
        .run()
        .completed()
        .unwrap();

    let stats = pixelized.stats.unwrap();
    assert_eq!(
        stats,
        Stats {
            count: 3,
            sum: 234.,
            mean: 78.
        }
    );
    assert_eq!(stats.to_string(), "78.00");

    let geometry = pixelized.geometry.unwrap();
    assert_close(geometry.unsigned_area(), 3.);
    assert_eq!(geometry.bounding_rect(), Some(Rect::new((1., 1.), (3., 3.))));
    Ok(())
}

#[test]
fn fully_covered_square() {
    let pixelized = PixelizeTask::new(constant_raster(10, 3.), 1, square(2., 2., 7., 7.))
        .workers(4)
        .run()
        .completed()
        .unwrap();

    let stats = pixelized.stats.unwrap();
    assert_eq!((stats.count, stats.sum, stats.mean), (25, 75., 3.));

    let geometry = pixelized.geometry.unwrap();
    assert_eq!(geometry.0.len(), 1);
    assert_close(geometry.unsigned_area(), 25.);
    assert_eq!(geometry.bounding_rect(), Some(Rect::new((2., 2.), (7., 7.))));
}

#[test]
fn sliver_matches_nothing() {
    let result = PixelizeTask::new(indexed_raster(), 1, square(0.1, 0.1, 0.3, 0.9)).run();
    assert_eq!(result, RunResult::Completed(Pixelized::default()));
}

#[test]
fn outside_the_raster_has_no_values() {
    let result = PixelizeTask::new(indexed_raster(), 1, square(100., 100., 105., 105.)).run();
    assert_eq!(result, RunResult::Completed(Pixelized::default()));
}

#[test]
fn empty_geometry() {
    let task = PixelizeTask::new(indexed_raster(), 1, MultiPolygon::<f64>(vec![]));
    assert_eq!(task.run(), RunResult::Completed(Pixelized::default()));
}

#[test]
fn no_data_cells_are_excluded() -> anyhow::Result<()> {
    let mut values = Array2::from_elem((4, 4), 5u16);
    values[[1, 1]] = 0;
    values[[2, 2]] = 0;
    let raster = Arc::new(MemoryRaster::new(0., 0., 1., 1., vec![values])?.with_no_data(1, 0)?);

    let pixelized = PixelizeTask::new(raster, 1, square(0., 0., 4., 4.))
        .run()
        .completed()
        .unwrap();
    let stats = pixelized.stats.unwrap();
    assert_eq!((stats.count, stats.sum), (14, 70.));
    assert_close(pixelized.geometry.unwrap().unsigned_area(), 14.);
    Ok(())
}

#[test]
fn worker_count_does_not_change_the_result() {
    let field = polygon![
        (x: 0.3, y: 0.2),
        (x: 9.1, y: 1.7),
        (x: 6.4, y: 9.8),
        (x: 2.2, y: 6.1),
    ];
    let run = |workers| {
        PixelizeTask::new(indexed_raster(), 1, field.clone())
            .workers(workers)
            .run()
            .completed()
            .unwrap()
    };
    let single = run(1);
    let many = run(8);

    assert_eq!(single.stats, many.stats);
    assert!(single.stats.is_some());
    let (single, many) = (single.geometry.unwrap(), many.geometry.unwrap());
    assert_close(single.unsigned_area(), many.unsigned_area());
    assert_eq!(single.bounding_rect(), many.bounding_rect());
}

#[test]
fn sequential_matches_pooled() -> anyhow::Result<()> {
    let raster = indexed_raster();
    let field = polygon![
        (x: 1.5, y: 0.5),
        (x: 8.5, y: 2.5),
        (x: 4.5, y: 8.5),
    ];

    let pooled = PixelizeTask::new(Arc::clone(&raster), 1, field.clone())
        .workers(3)
        .run()
        .completed()
        .unwrap();
    let sequential = pixelize_sequential(raster.as_ref(), 1, &field.into())?;

    assert_eq!(pooled.stats, sequential.stats);
    let (pooled, sequential) = (pooled.geometry.unwrap(), sequential.geometry.unwrap());
    assert_close(pooled.unsigned_area(), sequential.unsigned_area());
    Ok(())
}

#[test]
fn cancel_before_run() {
    let task = PixelizeTask::new(indexed_raster(), 1, square(0., 0., 5., 5.));
    task.cancel();
    assert_eq!(task.run(), RunResult::Cancelled);
}

#[test]
fn cancel_from_progress_observer() {
    let raster = constant_raster(100, 1.);
    let task = PixelizeTask::new(raster, 1, square(5., 5., 95., 95.)).workers(2);
    let token = task.cancellation_token();
    let result = task
        .on_progress(move |percent| {
            if percent >= 10. {
                token.cancel();
            }
        })
        .run();
    assert_eq!(result, RunResult::Cancelled);
    assert_eq!(result.state(), TaskState::Cancelled);
}

#[test]
fn progress_is_monotone_and_finishes() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observer_seen = Arc::clone(&seen);
    let result = PixelizeTask::new(indexed_raster(), 1, square(1., 1., 8., 6.))
        .workers(4)
        .on_progress(move |percent| observer_seen.lock().unwrap().push(percent))
        .run();
    assert!(result.is_completed());

    let seen = seen.lock().unwrap();
    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]));
    assert!(seen.iter().all(|percent| (0. ..=100.).contains(percent)));
    assert_eq!(seen.last(), Some(&100.));
}

#[test]
fn invalid_band() {
    let result = PixelizeTask::new(indexed_raster(), 2, square(0., 0., 5., 5.)).run();
    assert!(matches!(
        result,
        RunResult::Failed(PixelizeError::DataUnavailable(_))
    ));
    assert_eq!(result.state(), TaskState::Failed);
}

#[test]
fn non_finite_coordinates() {
    let field = polygon![
        (x: 0., y: 0.),
        (x: f64::NAN, y: 1.),
        (x: 1., y: 1.),
    ];
    let result = PixelizeTask::new(indexed_raster(), 1, field).run();
    assert_eq!(result, RunResult::Failed(PixelizeError::NonFiniteCoordinate));
}

#[test]
fn completion_callback_sees_the_result() {
    let called = Arc::new(AtomicBool::new(false));
    let callback_called = Arc::clone(&called);
    let result = PixelizeTask::new(indexed_raster(), 1, square(0., 0., 2., 2.))
        .on_completed(move |result| {
            assert!(result.is_completed());
            callback_called.store(true, Ordering::SeqCst);
        })
        .run();
    assert!(result.is_completed());
    assert!(called.load(Ordering::SeqCst));
}

#[test]
fn background_task() -> anyhow::Result<()> {
    let task = PixelizeTask::new(constant_raster(10, 2.), 1, square(0., 0., 3., 3.)).workers(2);
    assert_eq!(task.state(), TaskState::Pending);

    let handle = task.start()?;
    let result = handle.join();
    let stats = result.completed().unwrap().stats.unwrap();
    assert_eq!((stats.count, stats.sum), (9, 18.));
    Ok(())
}

#[test]
fn background_task_reports_final_state() -> anyhow::Result<()> {
    let handle = PixelizeTask::new(indexed_raster(), 1, square(0., 0., 3., 3.)).start()?;
    while !handle.is_finished() {
        std::thread::yield_now();
    }
    assert_eq!(handle.state(), TaskState::Completed);
    assert!(handle.join().is_completed());
    Ok(())
}

/// 读取时总是panic的栅格
struct BrokenRaster;

impl RasterSource for BrokenRaster {
    fn extent(&self) -> Rect<f64> {
        Rect::new((0., 0.), (10., 10.))
    }

    fn pixel_size_x(&self) -> f64 {
        1.
    }

    fn pixel_size_y(&self) -> f64 {
        1.
    }

    fn band_count(&self) -> usize {
        1
    }

    fn no_data_value(&self, _band: usize) -> Option<f64> {
        None
    }

    fn read_block(&self, _band: usize, _block: &AlignedBlock) -> Result<RasterBlock> {
        panic!("磁盘已损坏")
    }
}

#[test]
fn panicking_source_fails_the_background_task() -> anyhow::Result<()> {
    let handle = PixelizeTask::new(Arc::new(BrokenRaster), 1, square(0., 0., 3., 3.)).start()?;
    let result = handle.join();
    assert_eq!(
        result,
        RunResult::Failed(PixelizeError::Job(JobError::Panicked(
            "磁盘已损坏".to_string()
        )))
    );
    Ok(())
}

/// 总是返回一个1x1块的栅格
struct ShortRaster;

impl RasterSource for ShortRaster {
    fn extent(&self) -> Rect<f64> {
        Rect::new((0., 0.), (10., 10.))
    }

    fn pixel_size_x(&self) -> f64 {
        1.
    }

    fn pixel_size_y(&self) -> f64 {
        1.
    }

    fn band_count(&self) -> usize {
        1
    }

    fn no_data_value(&self, _band: usize) -> Option<f64> {
        None
    }

    fn read_block(&self, _band: usize, _block: &AlignedBlock) -> Result<RasterBlock> {
        Ok(RasterBlock::new(Array2::zeros((1, 1)), None))
    }
}

#[test]
fn wrong_block_shape_is_rejected() {
    let result = PixelizeTask::new(Arc::new(ShortRaster), 1, square(0., 0., 3., 3.)).run();
    assert!(matches!(
        result,
        RunResult::Failed(PixelizeError::DataUnavailable(_))
    ));
}

#[test]
fn trait_objects_work_as_sources() {
    let raster: Arc<dyn RasterSource> = constant_raster(10, 1.);
    let stats = PixelizeTask::new(raster, 1, square(0., 0., 2., 2.))
        .run()
        .completed()
        .unwrap()
        .stats
        .unwrap();
    assert_eq!(stats.count, 4);
}
