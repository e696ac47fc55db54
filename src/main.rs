fn main() {
    if let Err(err) = imaging_session_lib::run() {
        eprintln!("imaging-session: {err:#}");
        std::process::exit(1);
    }
}
