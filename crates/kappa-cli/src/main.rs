fn main() {
    std::process::exit(kappa_cli::cli::run_from_env());
}
