//! Command-line sweep driver
//!
//! Runs the KBA sweep on an in-process SPMD cluster (one OS thread per rank)
//! with the scaled verification quantities, alternating the input and output
//! state across iterations, and prints a JSON summary:
//!
//! ```text
//! snsweep --ncell_x 16 --ncell_y 16 --ncell_z 8 --ne 4 --na 8 --nm 4 \
//!         --nproc_x 2 --nproc_y 2 --nblock_z 2 --nthread_octant 2 \
//!         --niterations 2
//! ```
//!
//! All flags are optional; `--sync 1` selects the synchronous red/black
//! communicator and `--guarded_vo 1` permits `nsemiblock < nthread_octant`.
//! Logging goes through `tracing` and is controlled by `RUST_LOG`.

#![forbid(unsafe_code)]

use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;

use snsweep::quantities::split_extent;
use snsweep::{
    Cluster, Dimensions, GlobalGeom, ScaledQuantities, SweepConfig, Sweeper, Transforms, P,
};

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn parse_usize(args: &[String], key: &str, default: usize) -> Result<usize> {
    match parse_flag(args, key) {
        None => Ok(default),
        Some(s) => s.parse::<usize>().with_context(|| format!("bad value for {key}: {s}")),
    }
}

fn parse_bool(args: &[String], key: &str, default: bool) -> bool {
    match parse_flag(args, key) {
        None => default,
        Some(s) => matches!(s.as_str(), "1" | "true" | "yes" | "y"),
    }
}

#[derive(Serialize)]
struct Summary {
    normsq: P,
    nstep: usize,
    niterations: usize,
    nproc_x: usize,
    nproc_y: usize,
    ncell_x: usize,
    ncell_y: usize,
    ncell_z: usize,
    config: SweepConfig,
    elapsed_secs: f64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let nx_g = parse_usize(&args, "--ncell_x", 8)?;
    let ny_g = parse_usize(&args, "--ncell_y", 8)?;
    let nz = parse_usize(&args, "--ncell_z", 8)?;
    let ne = parse_usize(&args, "--ne", 4)?;
    let nm = parse_usize(&args, "--nm", 4)?;
    let na = parse_usize(&args, "--na", 8)?;
    let nu = parse_usize(&args, "--nu", 4)?;
    let nproc_x = parse_usize(&args, "--nproc_x", 1)?;
    let nproc_y = parse_usize(&args, "--nproc_y", 1)?;
    let niterations = parse_usize(&args, "--niterations", 1)?;

    let nthread_octant = parse_usize(&args, "--nthread_octant", 1)?;
    let cfg = SweepConfig {
        nblock_z: parse_usize(&args, "--nblock_z", 1)?,
        nthread_octant,
        nsemiblock: parse_usize(&args, "--nsemiblock", nthread_octant)?,
        nthread_e: parse_usize(&args, "--nthread_e", 1)?,
        guarded_update: parse_bool(&args, "--guarded_vo", false),
        async_comm: !parse_bool(&args, "--sync", false),
    };

    let start = Instant::now();

    let per_rank: Vec<Result<P>> = Cluster::run(nproc_x, nproc_y, |mut env| {
        let (_, nx) = split_extent(nx_g, nproc_x, env.proc_x_this());
        let (_, ny) = split_extent(ny_g, nproc_y, env.proc_y_this());
        let dims = Dimensions::new(nx, ny, nz, ne, nm, na, nu)?;
        let geom = GlobalGeom::for_rank(&env, nx_g, ny_g);
        let mut sweeper = Sweeper::new(dims, geom, &env, cfg)?;
        let xf = Transforms::identity(&dims);
        let quan = ScaledQuantities;

        let mut vi = vec![1.0; dims.size_state()];
        let mut vo = vec![0.0; dims.size_state()];
        for _ in 0..niterations {
            sweeper.sweep(&mut vo, &vi, &quan, &xf, &mut env)?;
            std::mem::swap(&mut vi, &mut vo);
        }
        // After the final swap the result lives in `vi`.
        Ok(vi.iter().map(|v| v * v).sum())
    });

    let mut normsq = 0.0;
    for r in per_rank {
        normsq += r?;
    }

    let nstep = snsweep::StepScheduler::new(
        cfg.nblock_z,
        snsweep::NOCTANT / cfg.nthread_octant,
        nproc_x,
        nproc_y,
    )
    .nstep();

    let summary = Summary {
        normsq,
        nstep,
        niterations,
        nproc_x,
        nproc_y,
        ncell_x: nx_g,
        ncell_y: ny_g,
        ncell_z: nz,
        config: cfg,
        elapsed_secs: start.elapsed().as_secs_f64(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
