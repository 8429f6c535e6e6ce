//! Integration test cases.
//!
//! The write tests reprogram the start of the chip in the socket.

use std::time::Duration;

use colored::Colorize;

use crate::device::DeviceClient;
use crate::protocol::{pattern, Message, READ_CHUNK_SIZE};

/// Size of the region the write tests program
const TEST_IMAGE_LEN: usize = 200;

/// Test result.
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    pub message: Option<String>,
}

impl TestResult {
    fn pass(name: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            message: None,
        }
    }

    fn fail(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            message: Some(message.to_string()),
        }
    }
}

impl From<anyhow::Result<()>> for TestResult {
    fn from(result: anyhow::Result<()>) -> Self {
        match result {
            Ok(()) => TestResult::pass("test"),
            Err(e) => TestResult::fail("test", &format!("Error: {:#}", e)),
        }
    }
}

/// Run a test function and print results as it happens.
fn run_test<F>(name: &str, device: &mut DeviceClient, test_fn: F) -> TestResult
where
    F: FnOnce(&mut DeviceClient) -> anyhow::Result<()>,
{
    print!("  {} ... ", name);
    std::io::Write::flush(&mut std::io::stdout()).ok();

    let mut result = TestResult::from(test_fn(device));
    result.name = name.to_string();

    if result.passed {
        println!("{}", "PASS".green().bold());
    } else {
        println!("{}", "FAIL".red().bold());
        if let Some(msg) = &result.message {
            println!("    {}", msg.red());
        }
    }

    result
}

/// Run all tests and return results.
pub fn run_all_tests(device: &mut DeviceClient) -> Vec<TestResult> {
    vec![
        run_test("Ready sent after reset", device, test_ready),
        run_test("Read splits into 32-byte chunks", device, test_read_framing),
        run_test("Reads are repeatable", device, test_read_repeatable),
        run_test("Write then verify with fix phase", device, test_write_verified),
        run_test("Corrupted chunk aborts write", device, test_corrupted_chunk),
        run_test("Verify reports and fixes mismatches", device, test_verify_fix),
        run_test("Invalid read range reported", device, test_invalid_range),
        run_test("Unknown command is ignored", device, test_unknown_command),
    ]
}

/// Print test results summary.
pub fn print_results(results: &[TestResult]) {
    println!("\n{}", "=".repeat(60));
    println!("{}", "Test Results".bold());
    println!("{}", "=".repeat(60));

    let mut passed = 0;
    let mut failed = 0;

    for result in results {
        if result.passed {
            println!("  {} {}", "[PASS]".green().bold(), result.name);
            passed += 1;
        } else {
            println!("  {} {}", "[FAIL]".red().bold(), result.name);
            if let Some(msg) = &result.message {
                println!("         {}", msg.red());
            }
            failed += 1;
        }
    }

    println!("{}", "-".repeat(60));
    println!(
        "  Total: {} passed, {} failed",
        passed.to_string().green(),
        if failed > 0 {
            failed.to_string().red()
        } else {
            failed.to_string().normal()
        }
    );
    println!("{}", "=".repeat(60));
}

// --- Individual Tests ---

fn test_ready(device: &mut DeviceClient) -> anyhow::Result<()> {
    device.reset()
}

fn test_read_framing(device: &mut DeviceClient) -> anyhow::Result<()> {
    let outcome = device.read(0x0000, 0x0064)?;

    let expected = [READ_CHUNK_SIZE, READ_CHUNK_SIZE, READ_CHUNK_SIZE, 4];
    if outcome.chunk_sizes != expected {
        anyhow::bail!("Expected chunk sizes {:?}, got {:?}", expected, outcome.chunk_sizes);
    }
    if outcome.data.len() != 100 {
        anyhow::bail!("Expected 100 bytes, got {}", outcome.data.len());
    }
    Ok(())
}

fn test_read_repeatable(device: &mut DeviceClient) -> anyhow::Result<()> {
    let first = device.read(0x0100, 0x0180)?;
    let second = device.read(0x0100, 0x0180)?;

    if first.data != second.data {
        anyhow::bail!("Two reads of the same range differ");
    }
    Ok(())
}

fn test_write_verified(device: &mut DeviceClient) -> anyhow::Result<()> {
    let image = pattern(TEST_IMAGE_LEN, 0x11);
    let outcome = device.write_verified(&image, 64)?;
    if !outcome.mismatches.is_empty() {
        print!("({} repaired) ", outcome.mismatches.len());
    }

    let readback = device.read(0, TEST_IMAGE_LEN as u16)?;
    if readback.data != image {
        anyhow::bail!("Chip contents differ from the written image");
    }
    Ok(())
}

fn test_corrupted_chunk(device: &mut DeviceClient) -> anyhow::Result<()> {
    let data = pattern(16, 0x42);
    match device.write_corrupted(&data)? {
        Message::InvalidChecksum { claimed, computed } if claimed != computed => {}
        other => anyhow::bail!("Expected InvalidChecksum, got {:?}", other),
    }

    // The session is over: no further ChunkRequest
    if let Some(message) = device.try_read_message(Duration::from_millis(500))? {
        anyhow::bail!("Unexpected message after abort: {:?}", message);
    }
    Ok(())
}

fn test_verify_fix(device: &mut DeviceClient) -> anyhow::Result<()> {
    let image = pattern(TEST_IMAGE_LEN, 0x23);
    device.write(&image, 100)?;

    // Verify against an image that differs at known addresses
    let mut altered = image.clone();
    let addresses = [5u16, 77, 150];
    for &address in &addresses {
        altered[address as usize] ^= 0xFF;
    }

    let outcome = device.verify(&altered, 50, None)?;
    let reported: Vec<u16> = outcome.mismatches.iter().map(|&(a, _, _)| a).collect();
    if reported != addresses {
        anyhow::bail!("Expected mismatches at {:?}, got {:?}", addresses, reported);
    }

    // Repair the chip to the altered image through the fix phase
    let fixes: Vec<(u16, u8)> = outcome.mismatches.iter().map(|&(a, e, _)| (a, e)).collect();
    device.verify(&altered, 50, Some(&fixes))?;

    let outcome = device.verify(&altered, 50, None)?;
    if !outcome.mismatches.is_empty() {
        anyhow::bail!("Mismatches remain after fix: {:?}", outcome.mismatches);
    }
    Ok(())
}

fn test_invalid_range(device: &mut DeviceClient) -> anyhow::Result<()> {
    device.reset()?;
    device.send(&crate::protocol::build_read(0x0200, 0x0100))?;

    match device.read_message()? {
        Message::Print(text) => {
            print!("({}) ", text);
        }
        other => anyhow::bail!("Expected Print, got {:?}", other),
    }

    if let Some(message) = device.try_read_message(Duration::from_millis(500))? {
        anyhow::bail!("Unexpected message after rejected range: {:?}", message);
    }
    Ok(())
}

fn test_unknown_command(device: &mut DeviceClient) -> anyhow::Result<()> {
    device.reset()?;
    device.send(&[0x7E])?;

    if let Some(message) = device.try_read_message(Duration::from_millis(500))? {
        anyhow::bail!("Expected silence, got {:?}", message);
    }
    Ok(())
}
