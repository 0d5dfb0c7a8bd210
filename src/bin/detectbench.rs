//! Detector micro-benchmark on synthetic signals.
//!
//! Generates band-limited noise, shifts a copy by a set of known delays, and
//! times `detect_delay` over each. Prints a JSON summary so regressions in
//! either accuracy or runtime show up in CI logs.

fn main() {
    if let Err(e) = run() {
        eprintln!("detectbench failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    use echoprobe::{detect_delay, DetectorConfig};
    use serde::Serialize;
    use std::time::Instant;

    #[derive(Debug)]
    struct Args {
        iterations: usize,
        duration_secs: f64,
        output: Option<std::path::PathBuf>,
    }

    #[derive(Debug, Clone, Serialize)]
    struct CaseResult {
        shift_samples: usize,
        iteration: usize,
        detected_ms: f64,
        error_ms: f64,
        top_correlation: f64,
        runtime_ms: f64,
    }

    #[derive(Debug, Clone, Serialize)]
    struct Summary {
        sample_rate: u32,
        duration_secs: f64,
        iterations: usize,
        max_abs_error_ms: f64,
        avg_runtime_ms: f64,
        cases: Vec<CaseResult>,
    }

    fn parse_args() -> Result<Args, String> {
        let mut iterations = 3usize;
        let mut duration_secs = 3.0f64;
        let mut output = None;

        let mut it = std::env::args().skip(1);
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "--iterations" => {
                    let Some(v) = it.next() else {
                        return Err("missing value for --iterations".into());
                    };
                    iterations = v
                        .parse::<usize>()
                        .map_err(|_| "invalid value for --iterations".to_string())?
                        .clamp(1, 20);
                }
                "--duration" => {
                    let Some(v) = it.next() else {
                        return Err("missing value for --duration".into());
                    };
                    duration_secs = v
                        .parse::<f64>()
                        .map_err(|_| "invalid value for --duration".to_string())?
                        .clamp(1.0, 30.0);
                }
                "--output" => {
                    let Some(v) = it.next() else {
                        return Err("missing value for --output".into());
                    };
                    output = Some(std::path::PathBuf::from(v));
                }
                "--help" | "-h" => {
                    println!(
                        "Usage: cargo run --bin detectbench -- \\
  [--iterations <n>] [--duration <secs>] [--output <file.json>]"
                    );
                    std::process::exit(0);
                }
                other => return Err(format!("unknown argument: {other}")),
            }
        }

        Ok(Args {
            iterations,
            duration_secs,
            output,
        })
    }

    /// Deterministic band-limited noise: LCG white noise smoothed with a
    /// 16-tap moving average.
    fn noise(len: usize, seed: u64) -> Vec<f32> {
        let mut state = seed;
        let white: Vec<f32> = (0..len + 16)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                ((state >> 33) as f32 / (1u64 << 31) as f32) - 1.0
            })
            .collect();
        white
            .windows(16)
            .map(|w| w.iter().sum::<f32>() / 16.0 * 2.0)
            .collect()
    }

    const SAMPLE_RATE: u32 = 48_000;
    const SHIFTS: [usize; 5] = [0, 480, 1237, 4800, 12000];

    let args = parse_args()?;
    let len = (SAMPLE_RATE as f64 * args.duration_secs) as usize;
    let config = DetectorConfig::default();

    let mut cases = Vec::new();
    for (case_idx, &shift) in SHIFTS.iter().enumerate() {
        let left = noise(len, 0x9E3779B9 + case_idx as u64);
        let mut right = vec![0.0f32; len];
        right[shift..].copy_from_slice(&left[..len - shift]);

        for iteration in 0..args.iterations {
            let started = Instant::now();
            let report = detect_delay(&left, &right, SAMPLE_RATE, &config);
            let runtime_ms = started.elapsed().as_secs_f64() * 1000.0;

            let expected_ms = shift as f64 * 1000.0 / SAMPLE_RATE as f64;
            let (detected_ms, top_correlation) = report
                .map(|r| (r.delay_ms, r.windows[0].correlation))
                .unwrap_or((-1.0, -1.0));

            cases.push(CaseResult {
                shift_samples: shift,
                iteration,
                detected_ms,
                error_ms: (detected_ms - expected_ms).abs(),
                top_correlation,
                runtime_ms,
            });
        }
    }

    let summary = Summary {
        sample_rate: SAMPLE_RATE,
        duration_secs: args.duration_secs,
        iterations: args.iterations,
        max_abs_error_ms: cases.iter().map(|c| c.error_ms).fold(0.0, f64::max),
        avg_runtime_ms: cases.iter().map(|c| c.runtime_ms).sum::<f64>() / cases.len() as f64,
        cases,
    };

    let json = serde_json::to_string_pretty(&summary).map_err(|e| e.to_string())?;
    if let Some(path) = args.output {
        std::fs::write(&path, &json).map_err(|e| e.to_string())?;
        println!("wrote {}", path.display());
    } else {
        println!("{json}");
    }

    Ok(())
}
