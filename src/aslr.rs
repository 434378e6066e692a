//! Recover the ASLR slide of a shared cache from a memory dump.
//!
//! The dump holds the cache as the process mapped it, laid out like the cache
//! file. Bound import slots of an image point at the slid address of the
//! exported symbol, the difference to the unslid export is the slide.
use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::cache::SharedCache;
use crate::errors::{Error, Result};
use crate::source::ByteSource;

/// A slide is a multiple of the smallest page size.
const SLIDE_ALIGNMENT: i64 = 0x1000;

/// Compute the slide of `memory`, a dump of `cache`, from the imports of image `index`.
///
/// The whole cache is assumed to be slid by one amount: the first slide found
/// must be page aligned and agree with the next resolvable import.
pub fn calc_aslr_slide<S, M>(cache: &SharedCache<S>, memory: &M, index: usize) -> Result<i64>
where
    S: ByteSource,
    M: ByteSource + ?Sized,
{
    let image = cache.open_image(index)?;
    let info = image.import_info(cache.string_tables())?;
    let mut slide = None;

    for import in &info.imports {
        let dylib = match import.dylib {
            Some(ref dylib) => dylib,
            None => continue,
        };
        let target = match cache.find_exported_symbol(dylib, &import.name) {
            Some(target) => target,
            None => {
                debug!("import {} from {} is not resolvable", import.name, dylib);
                continue;
            }
        };
        let off = match cache.va2off(import.address) {
            Some(off) => off,
            None => continue,
        };
        let raw = read_ptr(memory, off, cache.is_64bit(), cache.is_bigend())?;
        let value = cache.untag(raw);

        if info.contains(value) {
            trace!("import {} at 0x{:x} is not bound yet", import.name, import.address);
            continue;
        }

        let found = value.wrapping_sub(target) as i64;

        trace!(
            "import {} at 0x{:x} points to 0x{:x}, exported at 0x{:x}",
            import.name,
            import.address,
            value,
            target
        );

        match slide {
            None => {
                if found % SLIDE_ALIGNMENT != 0 {
                    return Err(Error::InconsistentStructure(format!(
                        "slide 0x{:x} from import {} is not page aligned",
                        found, import.name
                    )));
                }

                slide = Some(found);
            }
            Some(slide) if slide == found => {
                info!("cache slide 0x{:x}", slide);

                return Ok(slide);
            }
            Some(slide) => {
                return Err(Error::InconsistentStructure(format!(
                    "import {} slid by 0x{:x}, expected 0x{:x}",
                    import.name, found, slide
                )));
            }
        }
    }

    match slide {
        Some(slide) => {
            info!("cache slide 0x{:x} from a single import", slide);

            Ok(slide)
        }
        None => Err(Error::NotFound(format!(
            "resolvable import of {}",
            cache.image_path(index).unwrap_or("<unknown image>")
        ))),
    }
}

fn read_ptr<M: ByteSource + ?Sized>(memory: &M, off: u64, is_64bit: bool, bigend: bool) -> Result<u64> {
    let mut buf = [0; 8];
    let buf = if is_64bit { &mut buf[..] } else { &mut buf[..4] };

    memory.read_exact_at(off, buf)?;

    Ok(match (is_64bit, bigend) {
        (true, true) => BigEndian::read_u64(buf),
        (true, false) => LittleEndian::read_u64(buf),
        (false, true) => u64::from(BigEndian::read_u32(buf)),
        (false, false) => u64::from(LittleEndian::read_u32(buf)),
    })
}
