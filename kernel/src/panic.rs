//! Bare-metal panic handling.

use core::panic::PanicInfo;

#[panic_handler]
fn panic_handler(info: &PanicInfo) -> ! {
    log::error!("kernel panic: {}", info);
    loop {
        core::hint::spin_loop();
    }
}
