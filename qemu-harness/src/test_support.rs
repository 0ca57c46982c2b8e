use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

use crate::instance::Pipes;

/// The guest's ends of an in-memory pipe set.
pub(crate) struct GuestSide {
    pub(crate) console_out: DuplexStream,
    pub(crate) console_in: BufReader<DuplexStream>,
    pub(crate) control_out: DuplexStream,
    pub(crate) control_in: BufReader<DuplexStream>,
}

impl GuestSide {
    pub(crate) async fn say(&mut self, line: &str) {
        self.console_out
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
    }

    pub(crate) async fn say_control(&mut self, line: &str) {
        self.control_out
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
    }

    pub(crate) async fn heard(&mut self) -> String {
        let mut line = String::new();
        self.console_in.read_line(&mut line).await.unwrap();
        line
    }

    pub(crate) async fn heard_control(&mut self) -> String {
        let mut line = String::new();
        self.control_in.read_line(&mut line).await.unwrap();
        line
    }
}

pub(crate) fn duplex_pipes() -> (Pipes, GuestSide) {
    let (console_in, guest_console_in) = duplex(4096);
    let (console_out, guest_console_out) = duplex(4096);
    let (control_in, guest_control_in) = duplex(4096);
    let (control_out, guest_control_out) = duplex(4096);
    let pipes = Pipes::from_streams(console_in, console_out, control_in, control_out);
    let guest = GuestSide {
        console_out: guest_console_out,
        console_in: BufReader::new(guest_console_in),
        control_out: guest_control_out,
        control_in: BufReader::new(guest_control_in),
    };
    (pipes, guest)
}
