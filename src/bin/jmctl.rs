fn main() {
    std::process::exit(jobmon::jm::cli::run());
}
