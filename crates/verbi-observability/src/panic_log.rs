use std::{fs::OpenOptions, io::Write, path::Path};

use crate::trace::now_ms;

// Panics are appended to `panic.log` in the data dir, then handed to the
// previous hook. Writing never panics.
pub fn install_best_effort(data_dir: &Path) {
    let dir = data_dir.to_path_buf();
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let bt = std::backtrace::Backtrace::force_capture();
        let thread = std::thread::current();
        let msg = format!(
            "ts_ms={}\nthread={}\npanic={info}\nbacktrace={bt}\n---\n",
            now_ms(),
            thread.name().unwrap_or("<unnamed>"),
        );
        let _ = std::fs::create_dir_all(&dir);
        if let Ok(mut f) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("panic.log"))
        {
            let _ = f.write_all(msg.as_bytes());
        }
        previous(info);
    }));
}
