use clap::Parser;
use log::error;

use std::path::PathBuf;
use std::process::ExitCode;

use surfwarp::MeshTransformJob;

/// Transform the vertices of a GIfTI surface mesh from space 1 into space 2, using the affine and
/// the inverse warp of an ANTs registration that maps space 2 onto space 1.
#[derive(Debug, Parser)]
#[command(name = "surfwarp", version, about)]
struct Args {
    /// GIfTI surface mesh in space 1.
    input: PathBuf,

    /// Output path of the transformed GIfTI surface mesh.
    output: PathBuf,

    /// Affine transform, e.g. tfm_0GenericAffine.mat or an ITK text .tfm file.
    affine_transform: PathBuf,

    /// Inverse warp displacement field, e.g. tfm_1InverseWarp.nii.gz.
    inverse_warp_transform: PathBuf,

    /// Log the loaded transforms.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let job = MeshTransformJob::new(args.input, args.output, args.affine_transform, args.inverse_warp_transform);
    match job.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
