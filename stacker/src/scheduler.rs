//! Barrier-coordinated execution of the two-phase pipeline.
//!
//! Three group workers and the coordinator share one reusable barrier of
//! party four. Phase 1 (prepare) walks a fixed sequence of five rendezvous
//! points; Phase 2 (sweep) loops two rendezvous per step, with the
//! coordinator's mover assembly overlapping the workers' next stack.
//!
//! Between two consecutive barrier exits every shared buffer has exactly one
//! writer, fixed by phase and step; readers touch it only in a segment that
//! a barrier separates from the write. A panicking party raises the finished
//! flag and keeps honoring its remaining rendezvous, so the others drain and
//! the run terminates cleanly instead of wedging the barrier.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Barrier, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use indicatif::ProgressBar;
use log::{info, warn};
use ndarray::Array2;
use shared::aperture::Aperture;

use crate::coordinator::{RunContext, SuperGroup};
use crate::error::RunError;
use crate::group::GroupStacker;
use crate::mover::Mover;
use crate::settings::Settings;
use crate::stack::StackedImage;
use crate::sweep::SweepState;

/// Poll interval of the pause loop.
const PAUSE_POLL: Duration = Duration::from_secs(1);

/// External control surface of a running pipeline.
#[derive(Debug, Default)]
pub struct PipelineControl {
    paused: AtomicBool,
}

impl PipelineControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}

/// Everything the run produces.
#[derive(Debug)]
pub struct RunOutput {
    /// Movers ordered by score, best first.
    pub movers: Vec<Mover>,
    /// Groups with their final stacks, for the display collaborator.
    pub groups: Vec<GroupStacker>,
    pub super_stack: StackedImage,
    pub context: RunContext,
}

/// Pipeline phases; the per-thread behaviors are distinct functions
/// dispatched on this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Prepare,
    Sweep,
}

/// State shared by the four parties, single-writer between barriers.
struct RunShared {
    barrier: Barrier,
    sweep: RwLock<SweepState>,
    groups: [Mutex<GroupStacker>; 3],
    super_stack: RwLock<StackedImage>,
    flat: RwLock<Option<Array2<f32>>>,
    finished: AtomicBool,
}

impl RunShared {
    fn finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

/// Run a work segment, converting a panic into run termination so every
/// party exits at the next common decision point.
fn shielded<F: FnOnce()>(shared: &RunShared, label: &str, work: F) {
    if catch_unwind(AssertUnwindSafe(work)).is_err() {
        warn!("{label} failed, terminating run");
        shared.finish();
    }
}

/// Like [`shielded`], but skipped once the run is finished; for segments
/// that must not touch shared buffers while the parties drain.
fn guarded<F: FnOnce()>(shared: &RunShared, label: &str, work: F) {
    if shared.finished() {
        return;
    }
    shielded(shared, label, work);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run the full two-phase pipeline over exactly three groups.
///
/// Validates the group structure, then executes Phase 1 and the sweep on
/// four threads (the caller becomes the coordinator). Returns the sorted
/// movers together with the stacks.
pub fn run_pipeline(
    groups: Vec<GroupStacker>,
    settings: &Settings,
    arcsec_per_px: f64,
    control: &PipelineControl,
    progress: Option<&ProgressBar>,
) -> Result<RunOutput, RunError> {
    if groups.len() != 3 {
        return Err(RunError::GroupCount(groups.len()));
    }
    for group in &groups {
        if group.frames.is_empty() {
            return Err(RunError::EmptyGroup(group.index));
        }
    }
    let size = groups[0].size();
    for group in &groups[1..] {
        if group.size() != size {
            return Err(RunError::MixedDimensions(size, group.size()));
        }
    }

    let context = RunContext::from_groups(&groups, arcsec_per_px);
    let mut coordinator = SuperGroup::new(context.clone());

    let mut iter = groups.into_iter();
    let shared = RunShared {
        barrier: Barrier::new(4),
        sweep: RwLock::new(SweepState::new(settings)),
        groups: [
            Mutex::new(iter.next().unwrap()),
            Mutex::new(iter.next().unwrap()),
            Mutex::new(iter.next().unwrap()),
        ],
        super_stack: RwLock::new(StackedImage::new(context.size)),
        flat: RwLock::new(None),
        finished: AtomicBool::new(false),
    };

    thread::scope(|scope| {
        for index in 0..3 {
            let shared = &shared;
            let context = &context;
            scope.spawn(move || {
                worker(shared, context, settings, index, Phase::Prepare);
                worker(shared, context, settings, index, Phase::Sweep);
            });
        }
        coordinate(
            &shared,
            &mut coordinator,
            settings,
            control,
            progress,
            Phase::Prepare,
        );
        coordinate(
            &shared,
            &mut coordinator,
            settings,
            control,
            progress,
            Phase::Sweep,
        );
    });

    let [g0, g1, g2] = shared.groups;
    Ok(RunOutput {
        movers: coordinator.movers,
        groups: vec![
            g0.into_inner().unwrap_or_else(PoisonError::into_inner),
            g1.into_inner().unwrap_or_else(PoisonError::into_inner),
            g2.into_inner().unwrap_or_else(PoisonError::into_inner),
        ],
        super_stack: shared
            .super_stack
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner),
        context,
    })
}

/// Per-group worker behavior for one phase.
fn worker(
    shared: &RunShared,
    context: &RunContext,
    settings: &Settings,
    index: usize,
    phase: Phase,
) {
    match phase {
        Phase::Prepare => worker_prepare(shared, context, settings, index),
        Phase::Sweep => worker_sweep(shared, context, settings, index),
    }
}

/// Coordinator behavior for one phase.
fn coordinate(
    shared: &RunShared,
    coordinator: &mut SuperGroup,
    settings: &Settings,
    control: &PipelineControl,
    progress: Option<&ProgressBar>,
    phase: Phase,
) {
    match phase {
        Phase::Prepare => coordinate_prepare(shared, settings),
        Phase::Sweep => coordinate_sweep(shared, coordinator, settings, control, progress),
    }
}

/// Phase 1, worker side: prepare frames, stack, subtract, divide.
fn worker_prepare(shared: &RunShared, context: &RunContext, settings: &Settings, index: usize) {
    guarded(shared, "frame preparation", || {
        let mut group = lock(&shared.groups[index]);
        for frame in &mut group.frames {
            frame.compute_histogram(settings.black_fits, settings.black_fits, settings.white_fits);
            frame.stretch();
            if settings.blur {
                frame.blur();
            }
            if settings.deline {
                frame.de_line();
            }
            frame.set_static_offset(&context.reference, context.anchor);
        }
        group.build_static_stack(settings);
    });
    shared.barrier.wait(); // 1: static stacks ready

    shared.barrier.wait(); // 2: superstack ready
    guarded(shared, "star subtraction", || {
        let super_stack = shared
            .super_stack
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut group = lock(&shared.groups[index]);
        for frame in &mut group.frames {
            frame.subtract(&super_stack);
        }
    });
    shared.barrier.wait(); // 3: frames subtracted

    shared.barrier.wait(); // 4: flat ready
    if settings.flatten {
        guarded(shared, "flat division", || {
            let flat = shared.flat.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(flat) = flat.as_ref() {
                let mut group = lock(&shared.groups[index]);
                for frame in &mut group.frames {
                    frame.divide(flat);
                }
            }
        });
    }
    shared.barrier.wait(); // 5: prepared, transition to the sweep
}

/// Phase 1, coordinator side: normalize, superstack, flat.
fn coordinate_prepare(shared: &RunShared, settings: &Settings) {
    shared.barrier.wait(); // 1: static stacks ready
    guarded(shared, "superstack construction", || {
        let mut g0 = lock(&shared.groups[0]);
        let mut g1 = lock(&shared.groups[1]);
        let mut g2 = lock(&shared.groups[2]);
        SuperGroup::normalize([&mut g0, &mut g1, &mut g2]);
        let mut super_stack = shared
            .super_stack
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        SuperGroup::build_superstack([&g0, &g1, &g2], settings, &mut super_stack);
    });
    shared.barrier.wait(); // 2: superstack ready

    shared.barrier.wait(); // 3: frames subtracted
    if settings.flatten {
        guarded(shared, "flat synthesis", || {
            let g0 = lock(&shared.groups[0]);
            let g1 = lock(&shared.groups[1]);
            let g2 = lock(&shared.groups[2]);
            let mut flat = g0.size().empty_pixels();
            SuperGroup::build_flat([&g0, &g1, &g2], &mut flat);
            *shared.flat.write().unwrap_or_else(PoisonError::into_inner) = Some(flat);
        });
    }
    shared.barrier.wait(); // 4: flat ready

    shared.barrier.wait(); // 5: prepared, transition to the sweep
    info!("preparation complete, starting sweep");
}

/// Phase 2, worker side: stack along the hypothesis, detect, rendezvous.
fn worker_sweep(shared: &RunShared, context: &RunContext, settings: &Settings, index: usize) {
    loop {
        if shared.finished() {
            break;
        }
        guarded(shared, "tracked stack", || {
            let (motion, pa) = {
                let sweep = shared.sweep.read().unwrap_or_else(PoisonError::into_inner);
                (sweep.motion, sweep.pa)
            };
            let mut group = lock(&shared.groups[index]);
            group.build_tracked_stack(motion, pa, context.arcsec_per_px, settings);
            let aperture = Aperture::new(settings.aperture, context.track_len_px(motion), pa);
            group.find_objects(&aperture, settings);
        });
        shared.barrier.wait(); // A: stacks and objects ready
        shared.barrier.wait(); // B: tracklets built, sweep advanced
    }
}

/// Phase 2, coordinator side: tracklets, sweep advance, movers, pause poll.
fn coordinate_sweep(
    shared: &RunShared,
    coordinator: &mut SuperGroup,
    settings: &Settings,
    control: &PipelineControl,
    progress: Option<&ProgressBar>,
) {
    loop {
        if shared.finished() {
            break;
        }
        shared.barrier.wait(); // A: stacks and objects ready
        let mut advanced_out = false;
        let mut tracklets_built = false;
        guarded(shared, "tracklet construction", || {
            let g0 = lock(&shared.groups[0]);
            let g1 = lock(&shared.groups[1]);
            let g2 = lock(&shared.groups[2]);
            let mut sweep = shared
                .sweep
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            coordinator.build_tracklets([&g0, &g1, &g2], &sweep, settings);
            sweep.recompute_steps(
                settings.trk_err,
                coordinator.context.arcsec_per_px,
                coordinator.context.max_elapse,
            );
            advanced_out = sweep.advance();
            tracklets_built = true;
        });
        if advanced_out {
            shared.finish();
        }
        shared.barrier.wait(); // B: next hypothesis published

        // Overlaps the workers' next tracked stack; reads only the
        // snapshots captured in the tracklets. Gated on this round's
        // tracklets, not on the finished flag: the last in-bounds
        // hypothesis raises the flag above yet its tracklets still have
        // to feed the mover list.
        if tracklets_built {
            shielded(shared, "mover assembly", || {
                coordinator.build_movers(settings);
            });
        }
        if let Some(progress) = progress {
            progress.inc(1);
        }

        if shared.finished() {
            break;
        }
        while control.is_paused() {
            thread::sleep(PAUSE_POLL);
        }
    }
    coordinator.sort_movers();
    info!(
        "sweep complete, {} mover(s) retained",
        coordinator.movers.len()
    );
}
