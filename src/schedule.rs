//! Trigger schedule planning.
//!
//! The microcontroller repeats one cycle of pin state changes for the whole
//! recording. [`plan`] turns the pin assignment and pulse timings into that
//! cycle: camera trigger pulses, light pulses coincident with the exposures,
//! the depth-camera trigger, and any user-supplied custom events, all placed
//! so that machine-vision exposures never overlap a depth camera's infrared
//! subframe emissions. [`validate`] re-checks a planned schedule against the
//! configuration it came from.
//!
//! Depth cameras run at 30 Hz internally, emitting nine infrared subframes
//! per frame at a fixed 1575 us spacing; the external trigger input is acted
//! on three intersubframe periods before the first subframe. With several
//! depth cameras the subframes interleave back to back, each 160 us long.

use std::collections::HashSet;
use std::time::Duration;

use log::debug;

use crate::config::McuConfig;
use crate::error::{AcqError, AppResult};

/// Spacing between the starts of consecutive depth-camera subframes.
pub const DEPTH_INTERSUBFRAME_PERIOD_US: u32 = 1_575;
/// Infrared subframes per depth frame.
pub const DEPTH_NUM_SUBFRAMES: u32 = 9;
/// Subframe slots between the trigger input and the first emission.
pub const DEPTH_NUM_SUBFRAMES_BEFORE_TRIGGER: u32 = 3;
/// Duration of one camera's infrared emission within a subframe slot.
pub const DEPTH_SUBFRAME_DURATION_US: u32 = 160;
/// Cycle length when any depth camera is present (one 30 Hz depth frame).
pub const DEPTH_CYCLE_DURATION_US: u32 = 33_333;
/// Machine-vision frame rates that interleave cleanly with depth cameras.
pub const SUPPORTED_DEPTH_FPS: [u32; 5] = [30, 60, 90, 120, 150];

/// A single pin state change the microcontroller applies once per cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScheduleEvent {
    pub time_us: u32,
    pub pin: u16,
    pub state: u8,
}

/// One full cycle of state changes plus the side channels uploaded with it.
#[derive(Clone, Debug)]
pub struct Schedule {
    pub cycle_duration_us: u32,
    /// Sorted by time; equal-time events keep insertion order
    /// (camera triggers, then lights, then depth, then custom).
    pub events: Vec<ScheduleEvent>,
    pub input_pins: Vec<u16>,
    pub random_output_pins: Vec<u16>,
    pub cycles_per_random_bit_flip: u32,
}

impl Schedule {
    /// Number of cycles needed to cover `duration`.
    pub fn num_cycles(&self, duration: Duration) -> u32 {
        (duration.as_micros() / u128::from(self.cycle_duration_us)) as u32
    }
}

/// Compute the per-cycle trigger schedule.
///
/// `max_exposure_us` is the longest machine-vision exposure; it sizes the
/// default light pulse and bounds feasibility when exposures must fit in the
/// gaps between depth subframes.
pub fn plan(
    mcu: &McuConfig,
    n_depth: usize,
    fps: u32,
    max_exposure_us: u32,
) -> AppResult<Schedule> {
    if fps == 0 {
        return Err(AcqError::InfeasibleSchedule("fps must be nonzero".into()));
    }
    check_feasibility(mcu, n_depth, fps, max_exposure_us)?;

    let top_light_dur = mcu.top_light_dur_us.unwrap_or(max_exposure_us);
    let bottom_light_dur = mcu.bottom_light_dur_us.unwrap_or(max_exposure_us);

    let cycle_duration_us;
    let mut depth_changes: Vec<(u32, u8)> = Vec::new();
    let top_trigger_ons: Vec<u32>;
    let bottom_delay: u32;

    if n_depth == 0 {
        // One cycle per machine-vision frame.
        cycle_duration_us = 1_000_000 / fps;
        top_trigger_ons = vec![0];
        bottom_delay = mcu.bottom_camera_offset_us + top_light_dur;
    } else {
        // One cycle per depth frame.
        cycle_duration_us = DEPTH_CYCLE_DURATION_US;

        let depth_trig = DEPTH_NUM_SUBFRAMES_BEFORE_TRIGGER * DEPTH_INTERSUBFRAME_PERIOD_US;
        depth_changes.push((depth_trig, 1));
        depth_changes.push((depth_trig + mcu.depth_pulse_dur_us, 0));

        if fps == 30 {
            // A single exposure after the whole subframe train.
            top_trigger_ons = vec![DEPTH_INTERSUBFRAME_PERIOD_US * DEPTH_NUM_SUBFRAMES];
            bottom_delay = mcu.bottom_camera_offset_us + top_light_dur;
        } else {
            // Exposures tucked into the gaps between subframe emissions. The
            // onsets past the first are either one frame interval later or
            // pinned to an intersubframe boundary, whichever dodges the
            // emissions for that rate.
            let first = DEPTH_SUBFRAME_DURATION_US * n_depth as u32
                + mcu.gap_between_depth_and_basler_us;
            bottom_delay = DEPTH_INTERSUBFRAME_PERIOD_US;
            top_trigger_ons = match fps {
                60 => vec![first, first + 1_000_000 / 60],
                90 => vec![
                    first,
                    first + DEPTH_INTERSUBFRAME_PERIOD_US * 7,
                    first + 2_000_000 / 90,
                ],
                120 => vec![
                    first,
                    first + DEPTH_INTERSUBFRAME_PERIOD_US * 5,
                    first + 2_000_000 / 120,
                    first + 3_000_000 / 120,
                ],
                150 => vec![
                    first,
                    first + DEPTH_INTERSUBFRAME_PERIOD_US * 4,
                    first + DEPTH_INTERSUBFRAME_PERIOD_US * 8,
                    first + 3_000_000 / 150,
                    first + 4_000_000 / 150,
                ],
                // Unreachable past check_feasibility; keep the error anyway.
                other => {
                    return Err(AcqError::InfeasibleSchedule(format!(
                        "no interleaving defined for {other} fps"
                    )))
                }
            };
        }
    }

    let top_trigger_offs: Vec<u32> = offsets(&top_trigger_ons, mcu.basler_pulse_dur_us);
    let bottom_trigger_ons: Vec<u32> = offsets(&top_trigger_ons, bottom_delay);
    let bottom_trigger_offs: Vec<u32> = offsets(&bottom_trigger_ons, mcu.basler_pulse_dur_us);
    let top_light_offs: Vec<u32> = offsets(&top_trigger_ons, top_light_dur);
    let bottom_light_offs: Vec<u32> = offsets(&bottom_trigger_ons, bottom_light_dur);

    let mut events: Vec<ScheduleEvent> = Vec::new();
    push_events(&mut events, &top_trigger_ons, &mcu.top_camera_pins, 1);
    push_events(&mut events, &top_trigger_offs, &mcu.top_camera_pins, 0);
    push_events(&mut events, &bottom_trigger_ons, &mcu.bottom_camera_pins, 1);
    push_events(&mut events, &bottom_trigger_offs, &mcu.bottom_camera_pins, 0);
    push_events(&mut events, &top_trigger_ons, &mcu.top_light_pins, 1);
    push_events(&mut events, &top_light_offs, &mcu.top_light_pins, 0);
    push_events(&mut events, &bottom_trigger_ons, &mcu.bottom_light_pins, 1);
    push_events(&mut events, &bottom_light_offs, &mcu.bottom_light_pins, 0);
    for &(time, state) in &depth_changes {
        push_events(&mut events, &[time], &mcu.depth_trigger_pins, state);
    }
    for ((&time, &pin), &state) in mcu
        .custom_output_times
        .iter()
        .zip(&mcu.custom_output_pins)
        .zip(&mcu.custom_output_states)
    {
        events.push(ScheduleEvent {
            time_us: time,
            pin,
            state,
        });
    }

    // Stable: equal-time events keep the insertion order above.
    events.sort_by_key(|e| e.time_us);

    if let Some(late) = events.iter().find(|e| e.time_us >= cycle_duration_us) {
        return Err(AcqError::InfeasibleSchedule(format!(
            "event at {} us on pin {} falls outside the {} us cycle",
            late.time_us, late.pin, cycle_duration_us
        )));
    }

    debug!(
        "Planned {} state changes over a {} us cycle ({} depth cameras, {} fps)",
        events.len(),
        cycle_duration_us,
        n_depth,
        fps
    );

    Ok(Schedule {
        cycle_duration_us,
        events,
        input_pins: mcu.input_pins.clone(),
        random_output_pins: mcu.random_output_pins.clone(),
        cycles_per_random_bit_flip: mcu.cycles_per_random_bit_flip,
    })
}

/// Re-check a planned schedule against its configuration.
///
/// Runs the planner's feasibility rules plus: every event time inside the
/// cycle, every event pin present in the pin assignment, every state 0 or 1.
pub fn validate(
    mcu: &McuConfig,
    schedule: &Schedule,
    n_depth: usize,
    fps: u32,
    max_exposure_us: u32,
) -> AppResult<()> {
    check_feasibility(mcu, n_depth, fps, max_exposure_us)?;

    let assigned: HashSet<u16> = mcu
        .top_camera_pins
        .iter()
        .chain(&mcu.top_light_pins)
        .chain(&mcu.bottom_camera_pins)
        .chain(&mcu.bottom_light_pins)
        .chain(&mcu.depth_trigger_pins)
        .chain(&mcu.custom_output_pins)
        .copied()
        .collect();

    for event in &schedule.events {
        if event.time_us >= schedule.cycle_duration_us {
            return Err(AcqError::InfeasibleSchedule(format!(
                "event at {} us falls outside the {} us cycle",
                event.time_us, schedule.cycle_duration_us
            )));
        }
        if !assigned.contains(&event.pin) {
            return Err(AcqError::InfeasibleSchedule(format!(
                "event drives pin {} which is not in the pin assignment",
                event.pin
            )));
        }
        if event.state > 1 {
            return Err(AcqError::InfeasibleSchedule(format!(
                "event state {} is not 0 or 1",
                event.state
            )));
        }
    }
    Ok(())
}

fn check_feasibility(
    mcu: &McuConfig,
    n_depth: usize,
    fps: u32,
    max_exposure_us: u32,
) -> AppResult<()> {
    if n_depth > 0 && !SUPPORTED_DEPTH_FPS.contains(&fps) {
        return Err(AcqError::InfeasibleSchedule(format!(
            "fps must be one of {SUPPORTED_DEPTH_FPS:?} when depth cameras are present, not {fps}"
        )));
    }

    if n_depth > 0 && fps > 30 {
        let budget = DEPTH_INTERSUBFRAME_PERIOD_US
            .saturating_sub(n_depth as u32 * DEPTH_SUBFRAME_DURATION_US)
            .saturating_sub(2 * mcu.gap_between_depth_and_basler_us);
        if max_exposure_us > budget {
            return Err(AcqError::InfeasibleSchedule(format!(
                "exposure of {max_exposure_us} us does not fit the {budget} us intersubframe gap \
                 left by {n_depth} depth camera(s)"
            )));
        }
    }

    // Pin disjointness, restated here so a schedule can be rejected even when
    // the config-level validation was skipped.
    let role_pins: Vec<u16> = mcu
        .top_camera_pins
        .iter()
        .chain(&mcu.top_light_pins)
        .chain(&mcu.bottom_camera_pins)
        .chain(&mcu.bottom_light_pins)
        .chain(&mcu.depth_trigger_pins)
        .chain(&mcu.random_output_pins)
        .chain(&mcu.input_pins)
        .copied()
        .collect();
    let unique: HashSet<u16> = role_pins.iter().copied().collect();
    if unique.len() != role_pins.len()
        || mcu.custom_output_pins.iter().any(|p| unique.contains(p))
    {
        return Err(AcqError::InfeasibleSchedule(
            "a pin appears in more than one role".into(),
        ));
    }

    if mcu.custom_output_times.len() != mcu.custom_output_pins.len()
        || mcu.custom_output_pins.len() != mcu.custom_output_states.len()
    {
        return Err(AcqError::InfeasibleSchedule(
            "custom event arrays disagree on length".into(),
        ));
    }

    Ok(())
}

fn offsets(times: &[u32], delta: u32) -> Vec<u32> {
    times.iter().map(|&t| t + delta).collect()
}

fn push_events(events: &mut Vec<ScheduleEvent>, times: &[u32], pins: &[u16], state: u8) {
    for &time_us in times {
        for &pin in pins {
            events.push(ScheduleEvent {
                time_us,
                pin,
                state,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mcu() -> McuConfig {
        McuConfig {
            top_camera_pins: vec![1, 3],
            bottom_camera_pins: vec![11],
            depth_trigger_pins: vec![0],
            top_light_pins: vec![38, 39],
            bottom_light_pins: vec![16],
            input_pins: vec![10],
            ..McuConfig::default()
        }
    }

    /// Windows during which any depth camera is emitting infrared.
    fn depth_active_windows(schedule: &Schedule, mcu: &McuConfig, n_depth: u32) -> Vec<(u32, u32)> {
        let onset = schedule
            .events
            .iter()
            .find(|e| mcu.depth_trigger_pins.contains(&e.pin) && e.state == 1)
            .map(|e| e.time_us)
            .unwrap();
        (0..DEPTH_NUM_SUBFRAMES as i64)
            .map(|i| {
                let start = onset as i64
                    + (i - DEPTH_NUM_SUBFRAMES_BEFORE_TRIGGER as i64)
                        * DEPTH_INTERSUBFRAME_PERIOD_US as i64;
                (
                    start.rem_euclid(DEPTH_CYCLE_DURATION_US as i64) as u32,
                    (start + (n_depth * DEPTH_SUBFRAME_DURATION_US) as i64)
                        .rem_euclid(DEPTH_CYCLE_DURATION_US as i64) as u32,
                )
            })
            .collect()
    }

    #[test]
    fn test_no_depth_cycle_follows_fps() {
        let schedule = plan(&mcu(), 0, 100, 1000).unwrap();
        assert_eq!(schedule.cycle_duration_us, 10_000);
        // Single top onset at t=0 on both top pins.
        let top_ons: Vec<_> = schedule
            .events
            .iter()
            .filter(|e| [1u16, 3].contains(&e.pin) && e.state == 1)
            .collect();
        assert_eq!(top_ons.len(), 2);
        assert!(top_ons.iter().all(|e| e.time_us == 0));
        // No depth trigger events.
        assert!(!schedule.events.iter().any(|e| e.pin == 0));
    }

    #[test]
    fn test_all_events_inside_cycle() {
        for (n_depth, fps) in [(0usize, 100u32), (1, 30), (1, 120), (2, 60), (2, 150)] {
            let schedule = plan(&mcu(), n_depth, fps, 900).unwrap();
            assert!(schedule
                .events
                .iter()
                .all(|e| e.time_us < schedule.cycle_duration_us));
        }
    }

    #[test]
    fn test_depth_trigger_toggles_exactly_twice_per_cycle() {
        let schedule = plan(&mcu(), 2, 30, 1000).unwrap();
        assert_eq!(schedule.cycle_duration_us, DEPTH_CYCLE_DURATION_US);
        let depth_events: Vec<_> = schedule.events.iter().filter(|e| e.pin == 0).collect();
        assert_eq!(depth_events.len(), 2);
        assert_eq!(depth_events[0].state, 1);
        assert_eq!(
            depth_events[0].time_us,
            DEPTH_NUM_SUBFRAMES_BEFORE_TRIGGER * DEPTH_INTERSUBFRAME_PERIOD_US
        );
        assert_eq!(depth_events[1].state, 0);
        assert_eq!(depth_events[1].time_us, depth_events[0].time_us + 100);
    }

    #[test]
    fn test_camera_triggers_avoid_depth_emissions() {
        for fps in [60u32, 90, 120, 150] {
            for n_depth in [1u32, 2] {
                let schedule = plan(&mcu(), n_depth as usize, fps, 600).unwrap();
                let windows = depth_active_windows(&schedule, &mcu(), n_depth);
                for event in schedule
                    .events
                    .iter()
                    .filter(|e| [1u16, 3, 11].contains(&e.pin) && e.state == 1)
                {
                    for &(start, end) in &windows {
                        let inside = if start <= end {
                            event.time_us >= start && event.time_us <= end
                        } else {
                            // window wraps the cycle boundary
                            event.time_us >= start || event.time_us <= end
                        };
                        assert!(
                            !inside,
                            "{fps} fps / {n_depth} depth: trigger at {} us lands in \
                             emission window {start}..{end}",
                            event.time_us
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_expected_onset_count_per_rate() {
        for (fps, expected) in [(30u32, 1usize), (60, 2), (90, 3), (120, 4), (150, 5)] {
            let schedule = plan(&mcu(), 1, fps, 600).unwrap();
            let onsets = schedule
                .events
                .iter()
                .filter(|e| e.pin == 1 && e.state == 1)
                .count();
            assert_eq!(onsets, expected, "{fps} fps");
        }
    }

    #[test]
    fn test_equal_time_events_keep_insertion_order() {
        // Lights switch on together with the camera trigger; at that instant
        // camera events must precede light events.
        let schedule = plan(&mcu(), 0, 30, 1000).unwrap();
        let at_zero: Vec<u16> = schedule
            .events
            .iter()
            .filter(|e| e.time_us == 0)
            .map(|e| e.pin)
            .collect();
        assert_eq!(at_zero, vec![1, 3, 38, 39]);
    }

    #[test]
    fn test_light_pulses_span_the_exposure() {
        let exposure = 800;
        let schedule = plan(&mcu(), 0, 60, exposure).unwrap();
        let on = schedule
            .events
            .iter()
            .find(|e| e.pin == 38 && e.state == 1)
            .unwrap()
            .time_us;
        let off = schedule
            .events
            .iter()
            .find(|e| e.pin == 38 && e.state == 0)
            .unwrap()
            .time_us;
        assert_eq!(off - on, exposure);
    }

    #[test]
    fn test_custom_events_pass_through_verbatim() {
        let config = McuConfig {
            custom_output_times: vec![5_000, 100],
            custom_output_pins: vec![30, 31],
            custom_output_states: vec![1, 0],
            ..mcu()
        };
        let schedule = plan(&config, 0, 30, 1000).unwrap();
        let custom: Vec<_> = schedule
            .events
            .iter()
            .filter(|e| [30u16, 31].contains(&e.pin))
            .collect();
        assert_eq!(custom.len(), 2);
        // Sorted by time after concatenation.
        assert_eq!(custom[0].pin, 31);
        assert_eq!(custom[1].pin, 30);
    }

    #[test]
    fn test_unsupported_fps_with_depth_rejected() {
        let err = plan(&mcu(), 1, 100, 600).unwrap_err();
        assert!(matches!(err, AcqError::InfeasibleSchedule(_)));
    }

    #[test]
    fn test_exposure_beyond_intersubframe_budget_rejected() {
        // 1575 - 2*160 - 2*50 = 1155 us available.
        assert!(plan(&mcu(), 2, 120, 1155).is_ok());
        let err = plan(&mcu(), 2, 120, 1600).unwrap_err();
        assert!(err.to_string().contains("1155"));
        // A wider guard gap shrinks the budget below a 600 us exposure.
        let wide_gap = McuConfig {
            gap_between_depth_and_basler_us: 350,
            ..mcu()
        };
        assert!(plan(&wide_gap, 2, 150, 600).is_err());
    }

    #[test]
    fn test_repeated_pin_rejected() {
        let config = McuConfig {
            custom_output_times: vec![10],
            custom_output_pins: vec![1], // also a top camera pin
            custom_output_states: vec![1],
            ..mcu()
        };
        assert!(plan(&config, 0, 30, 1000).is_err());
    }

    #[test]
    fn test_mismatched_custom_arrays_rejected() {
        let config = McuConfig {
            custom_output_times: vec![10, 20],
            custom_output_pins: vec![30],
            custom_output_states: vec![1],
            ..mcu()
        };
        assert!(plan(&config, 0, 30, 1000).is_err());
    }

    #[test]
    fn test_validate_accepts_planner_output() {
        let config = mcu();
        let schedule = plan(&config, 2, 120, 900).unwrap();
        validate(&config, &schedule, 2, 120, 900).unwrap();
    }

    #[test]
    fn test_validate_rejects_stray_pin_and_bad_state() {
        let config = mcu();
        let mut schedule = plan(&config, 0, 30, 1000).unwrap();
        schedule.events.push(ScheduleEvent {
            time_us: 1,
            pin: 55,
            state: 1,
        });
        assert!(validate(&config, &schedule, 0, 30, 1000).is_err());

        let mut schedule = plan(&config, 0, 30, 1000).unwrap();
        schedule.events[0].state = 2;
        assert!(validate(&config, &schedule, 0, 30, 1000).is_err());
    }

    #[test]
    fn test_plan_is_deterministic() {
        let a = plan(&mcu(), 2, 120, 900).unwrap();
        let b = plan(&mcu(), 2, 120, 900).unwrap();
        assert_eq!(a.events, b.events);
        assert_eq!(a.cycle_duration_us, b.cycle_duration_us);
    }

    #[test]
    fn test_num_cycles() {
        let schedule = plan(&mcu(), 1, 30, 1000).unwrap();
        assert_eq!(schedule.num_cycles(Duration::from_secs(60)), 1800);
        let schedule = plan(&mcu(), 0, 100, 1000).unwrap();
        assert_eq!(schedule.num_cycles(Duration::from_secs(1)), 100);
    }
}
