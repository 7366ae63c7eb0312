//! End-to-end protocol scenarios: the real driver against the model
//! keyboard, byte for byte on the simulated wire.

use ps2kbd::{
    Event, Keyboard, KeyboardLeds, KeyboardOutput, NullDiagnostics, ScanCodeSet, TypematicDelay,
    TypematicRate,
};
use testjig::{FrameFault, Jig, SimPlatform, CLOCK_PIN};

fn count_events(jig: &Jig, want: &Event) -> usize {
    jig.events().into_iter().filter(|event| event == want).count()
}

#[test]
fn echo_round_trips() {
    let jig: Jig = Jig::new();
    assert!(jig.kb.echo());
    assert_eq!(jig.device_received(), vec![0xEE]);
    // The echo reply was consumed by the command; nothing left to read.
    assert_eq!(jig.kb.read_scan_code(), KeyboardOutput::Empty);
}

#[test]
fn read_id_composes_msb_first() {
    let jig: Jig = Jig::new();
    assert_eq!(jig.kb.read_id(), 0xAB83);
    assert_eq!(jig.device_received(), vec![0xF2]);
    assert_eq!(jig.kb.read_scan_code(), KeyboardOutput::Empty);
}

#[test]
fn set_leds_sends_command_then_mask() {
    let jig: Jig = Jig::new();
    assert!(jig.kb.send_led_status(KeyboardLeds::CAPS_LOCK | KeyboardLeds::NUM_LOCK));
    assert_eq!(jig.device_received(), vec![0xED, 0x06]);
}

#[test]
fn transmitted_frames_carry_valid_parity() {
    let jig: Jig = Jig::new();
    assert!(jig.kb.enable());
    assert!(jig.kb.disable());
    assert!(jig.kb.send_led_status(KeyboardLeds::ALL));
    assert_eq!(jig.device_received(), vec![0xF4, 0xF5, 0xED, 0x07]);
    assert!(jig.device_parity_ok().iter().all(|&ok| ok));
}

#[test]
fn parity_error_recovers_through_resend() {
    let jig: Jig = Jig::new();
    jig.fault_next_frame(FrameFault::BadParity);
    jig.type_byte(0x42);

    // Too soon after the failing edge: the driver must not break into the
    // device's line yet.
    assert_eq!(jig.kb.read_scan_code(), KeyboardOutput::Empty);
    assert_eq!(jig.device_received(), vec![]);

    jig.advance_us(250);
    assert_eq!(jig.kb.read_scan_code(), KeyboardOutput::Garbled);
    assert_eq!(jig.device_received(), vec![0xFE]);

    // The device resent the byte; this time it reads clean.
    assert_eq!(jig.kb.read_scan_code(), KeyboardOutput::Scan(0x42));
    assert_eq!(count_events(&jig, &Event::ParityError), 1);
}

#[test]
fn stop_bit_error_also_triggers_resend() {
    let jig: Jig = Jig::new();
    jig.fault_next_frame(FrameFault::BadStop);
    jig.type_byte(0x2D);

    jig.advance_us(250);
    assert_eq!(jig.kb.read_scan_code(), KeyboardOutput::Garbled);
    assert_eq!(jig.device_received(), vec![0xFE]);
    assert_eq!(jig.kb.read_scan_code(), KeyboardOutput::Scan(0x2D));
    assert_eq!(count_events(&jig, &Event::PacketDidNotEndWithOne), 1);
}

#[test]
fn spurious_clock_pulse_is_written_off_as_a_glitch() {
    let jig: Jig = Jig::new();
    jig.spurious_clock_pulse();

    assert_eq!(jig.kb.read_scan_code(), KeyboardOutput::Empty);
    jig.advance_us(250);
    assert_eq!(jig.kb.read_scan_code(), KeyboardOutput::Garbled);

    // A one-edge wonder is noise, not a byte: no resend went out.
    assert_eq!(jig.device_received(), vec![]);
    assert_eq!(count_events(&jig, &Event::ClockLineGlitch { bits_received: 1 }), 1);

    // And the receiver realigned: the next real frame is fine.
    jig.type_byte(0x33);
    assert_eq!(jig.kb.read_scan_code(), KeyboardOutput::Scan(0x33));
}

#[test]
fn overflow_drops_oldest_and_reports_once() {
    let jig: Jig<2> = Jig::new();
    jig.type_byte(0x1C);
    jig.type_byte(0x32);
    jig.type_byte(0x23);

    assert_eq!(jig.kb.read_scan_code(), KeyboardOutput::Scan(0x32));
    assert_eq!(jig.kb.read_scan_code(), KeyboardOutput::Scan(0x23));
    assert_eq!(jig.kb.read_scan_code(), KeyboardOutput::Empty);
    let overflows = jig
        .events()
        .iter()
        .filter(|event| matches!(event, Event::BufferOverflow))
        .count();
    assert_eq!(overflows, 1);
}

#[test]
fn stray_self_test_report_is_swallowed() {
    let jig: Jig = Jig::new();
    jig.type_byte(0xAA);
    jig.type_byte(0x1C);
    assert_eq!(jig.kb.read_scan_code(), KeyboardOutput::Scan(0x1C));

    jig.type_byte(0xAA);
    assert_eq!(jig.kb.read_scan_code(), KeyboardOutput::Empty);
}

#[test]
fn failed_self_test_is_swallowed_but_reported() {
    let jig: Jig = Jig::new();
    jig.type_byte(0xFC);
    assert_eq!(jig.kb.read_scan_code(), KeyboardOutput::Empty);
    assert_eq!(count_events(&jig, &Event::StartupFailure), 1);
}

#[test]
fn await_startup_sees_the_power_on_report() {
    let jig: Jig = Jig::new();
    jig.type_byte(0xAA);
    assert!(jig.kb.await_startup());
}

#[test]
fn await_startup_times_out_on_a_silent_keyboard() {
    let jig: Jig = Jig::new();
    let before = jig.now_us();
    assert!(!jig.kb.await_startup());
    let elapsed = jig.now_us() - before;
    assert!(elapsed >= 750_000, "gave up after only {elapsed} us");
    assert_eq!(
        count_events(&jig, &Event::NoResponse { expected: KeyboardOutput::BatSuccess }),
        1
    );
}

#[test]
fn reset_acks_then_passes_self_test() {
    let jig: Jig = Jig::new();
    assert!(jig.kb.reset());
    assert_eq!(jig.device_received(), vec![0xFF]);
    assert_eq!(jig.kb.read_scan_code(), KeyboardOutput::Empty);
}

#[test]
fn scan_code_set_round_trips() {
    let jig: Jig = Jig::new();
    assert_eq!(jig.kb.get_scan_code_set(), Some(ScanCodeSet::PcAt));
    assert!(jig.kb.set_scan_code_set(ScanCodeSet::Ps2));
    assert_eq!(jig.kb.get_scan_code_set(), Some(ScanCodeSet::Ps2));
    assert_eq!(jig.device_received(), vec![0xF0, 0x00, 0xF0, 0x03, 0xF0, 0x00]);
}

#[test]
fn typematic_byte_packs_rate_low_and_delay_high() {
    let jig: Jig = Jig::new();
    assert!(jig
        .kb
        .set_typematic_rate_and_delay(TypematicRate::DEFAULT, TypematicDelay::Ms500));
    assert_eq!(jig.device_received(), vec![0xF3, 0x2B]);
}

#[test]
fn key_list_commands_ack_every_byte() {
    let jig: Jig = Jig::new();
    assert!(jig.kb.disable_break_codes_for(&[0x1C, 0x32]));
    assert_eq!(jig.device_received(), vec![0xFB, 0x1C, 0x32]);
}

#[test]
fn silent_keyboard_fails_the_command_within_its_budget() {
    let jig: Jig = Jig::new();
    jig.silence_device();
    let before = jig.now_us();
    assert!(!jig.kb.enable());
    let elapsed = jig.now_us() - before;
    assert!(elapsed >= 10_000, "gave up after only {elapsed} us");
    assert!(elapsed < 100_000, "kept waiting for {elapsed} us");
    assert_eq!(
        count_events(&jig, &Event::NoResponse { expected: KeyboardOutput::Ack }),
        1
    );
}

#[test]
fn ack_wait_survives_millisecond_wraparound() {
    let jig: Jig = Jig::new();
    jig.silence_device();
    jig.warp_millis(u32::MAX - 3);
    let before = jig.now_us();
    assert!(!jig.kb.enable());
    let elapsed = jig.now_us() - before;
    // The stop deadline wrapped past zero; the wait must still run its
    // full budget rather than give up on the spot.
    assert!(elapsed >= 10_000, "wait collapsed at wraparound: {elapsed} us");
    assert!(elapsed < 100_000, "wait never ended: {elapsed} us");
}

#[test]
fn missing_ack_pulse_is_a_send_frame_error() {
    let jig: Jig = Jig::new();
    jig.drop_ack_pulse();
    assert!(!jig.kb.enable());
    assert_eq!(count_events(&jig, &Event::SendFrameError), 1);
    assert_eq!(
        count_events(&jig, &Event::NoResponse { expected: KeyboardOutput::Ack }),
        1
    );
}

#[test]
fn mismatched_reply_stays_queued() {
    let jig: Jig = Jig::new();
    jig.echo_reply_with(0x31);
    assert!(!jig.kb.echo());
    assert_eq!(
        count_events(
            &jig,
            &Event::IncorrectResponse {
                got: KeyboardOutput::Scan(0x31),
                expected: KeyboardOutput::Echo,
            }
        ),
        1
    );
    // The wrong byte was not consumed by the command path.
    assert_eq!(jig.kb.read_scan_code(), KeyboardOutput::Scan(0x31));
}

#[test]
fn typed_stream_reads_in_arrival_order() {
    let jig: Jig = Jig::new();
    // Break sequence for 'T' in set 2: F0 2C, preceded by the make.
    for byte in [0x2C, 0xF0, 0x2C] {
        jig.type_byte(byte);
    }
    assert_eq!(jig.kb.read_scan_code(), KeyboardOutput::Scan(0x2C));
    assert_eq!(jig.kb.read_scan_code(), KeyboardOutput::BreakPrefix);
    assert_eq!(jig.kb.read_scan_code(), KeyboardOutput::Scan(0x2C));
    assert_eq!(jig.kb.read_scan_code(), KeyboardOutput::Empty);
}

#[test]
fn clock_pin_is_exclusive_while_claimed() {
    let jig: Jig = Jig::new();
    let rival: &'static Keyboard<SimPlatform, NullDiagnostics> = Box::leak(Box::new(
        Keyboard::new(testjig::rival_platform(), CLOCK_PIN, 6, NullDiagnostics),
    ));
    assert!(!rival.begin());
    drop(jig);
}
