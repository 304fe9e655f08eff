//! Minimal server: `cargo run --example hello`, then
//! `curl http://localhost:3000/`.

use osrv::prelude::*;

fn main() {
    let rt = asupersync::runtime::RuntimeBuilder::current_thread()
        .build()
        .expect("runtime must build");

    rt.block_on(async {
        let mut server = osrv::server(|req: &mut Request| {
            let path = req.url().path().to_string();
            let version = req.runtime().http_version();
            async move {
                Ok(Response::json(&serde_json::json!({
                    "path": path,
                    "httpVersion": version.as_str(),
                })))
            }
        })
        .build();

        if let Err(err) = osrv::run_until_signal(&mut server).await {
            eprintln!("server failed: {err}");
        }
    });
}
