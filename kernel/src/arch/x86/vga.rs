//! VGA text-mode console: 80x25, light grey on black, scrolling.

use spin::Mutex;

const BUFFER_ADDR: usize = 0xB8000;
const WIDTH: usize = 80;
const HEIGHT: usize = 25;
const ATTR: u8 = 0x07;

struct VgaWriter {
    row: usize,
    col: usize,
}

static WRITER: Mutex<VgaWriter> = Mutex::new(VgaWriter { row: 0, col: 0 });

impl VgaWriter {
    fn cell_ptr(&self, row: usize, col: usize) -> *mut u16 {
        (BUFFER_ADDR + (row * WIDTH + col) * 2) as *mut u16
    }

    fn put_cell(&self, row: usize, col: usize, byte: u8) {
        let value = (ATTR as u16) << 8 | byte as u16;
        // SAFETY: row/col are bounded by WIDTH/HEIGHT; the VGA buffer is
        // identity-mapped hardware memory.
        unsafe { core::ptr::write_volatile(self.cell_ptr(row, col), value) };
    }

    fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.newline(),
            b'\r' => self.col = 0,
            _ => {
                self.put_cell(self.row, self.col, byte);
                self.col += 1;
                if self.col == WIDTH {
                    self.newline();
                }
            }
        }
    }

    fn newline(&mut self) {
        self.col = 0;
        if self.row + 1 < HEIGHT {
            self.row += 1;
            return;
        }
        // Scroll everything up one line.
        for row in 1..HEIGHT {
            for col in 0..WIDTH {
                // SAFETY: bounded VGA cells.
                let value = unsafe { core::ptr::read_volatile(self.cell_ptr(row, col)) };
                // SAFETY: bounded VGA cells.
                unsafe { core::ptr::write_volatile(self.cell_ptr(row - 1, col), value) };
            }
        }
        for col in 0..WIDTH {
            self.put_cell(HEIGHT - 1, col, b' ');
        }
    }

    fn clear(&mut self) {
        for row in 0..HEIGHT {
            for col in 0..WIDTH {
                self.put_cell(row, col, b' ');
            }
        }
        self.row = 0;
        self.col = 0;
    }
}

/// Blank the screen and reset the cursor.
pub fn clear() {
    WRITER.lock().clear();
}

/// Write raw bytes at the cursor.
pub fn write_bytes(bytes: &[u8]) {
    let mut writer = WRITER.lock();
    for &b in bytes {
        writer.write_byte(b);
    }
}
