#[macro_use]
extern crate log;

use std::fs::File;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use memmap::Mmap;
use structopt::StructOpt;

use mach_dyld::*;

#[derive(Debug, StructOpt)]
#[structopt(name = "dyldinfo", about = "Dump Mach-O images, dyld shared caches and kernelcaches")]
struct Opt {
    /// Print the mach header
    #[structopt(long)]
    header: bool,

    /// Print the load commands
    #[structopt(short = "l", long = "load-commands")]
    load_commands: bool,

    /// Print the linked dylibs
    #[structopt(short = "L", long)]
    dylibs: bool,

    /// Print the rebase records
    #[structopt(long)]
    rebase: bool,

    /// Print the bind records, weak and lazy ones included
    #[structopt(long)]
    bind: bool,

    /// Print the export trie
    #[structopt(long)]
    exports: bool,

    /// Print the resolved imports
    #[structopt(long)]
    imports: bool,

    /// Print the symbol table
    #[structopt(long)]
    symbols: bool,

    /// Print the function starts
    #[structopt(long = "function-starts")]
    function_starts: bool,

    /// Print the mappings of a shared cache
    #[structopt(long)]
    mappings: bool,

    /// Print the images of a shared cache
    #[structopt(long)]
    images: bool,

    /// Print the slid pointers of a shared cache or the threaded pointers of a kernelcache
    #[structopt(long)]
    pointers: bool,

    /// Print the prelinked kexts of a kernelcache
    #[structopt(long)]
    kexts: bool,

    /// Dump the image with this install name (or index) of a shared cache
    #[structopt(long)]
    image: Option<String>,

    /// Compute the ASLR slide of this memory dump of the shared cache
    #[structopt(long, parse(from_os_str))]
    aslr: Option<PathBuf>,

    /// Files to process
    #[structopt(parse(from_os_str), required = true)]
    files: Vec<PathBuf>,
}

fn main() -> Result<()> {
    let _ = pretty_env_logger::try_init();

    let opt = Opt::from_args();

    for path in &opt.files {
        process(&opt, path).with_context(|| format!("process {:?}", path))?;
    }

    Ok(())
}

fn process(opt: &Opt, path: &Path) -> Result<()> {
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file) }?;
    let payload = mmap.as_ref();

    println!("{}:", path.display());

    if payload.starts_with(b"dyld_v1") {
        return dump_cache(opt, payload);
    }

    match OFile::parse(payload)? {
        OFile::MachFile(ref file) if file.header.filetype == MH_EXECUTE && is_kernelcache(payload) => {
            dump_kernelcache(opt, payload)
        }
        OFile::MachFile(_) => dump_image(opt, &MachImage::parse(payload, 0, LoadHint::File)?, None),
        OFile::FatFile { files, .. } => {
            for (arch, _) in files {
                println!("architecture {}:", get_cpu_subtype_type(arch.cpusubtype));
                print!("{}", arch);

                let sub = SubSource::new(payload, u64::from(arch.offset), Some(u64::from(arch.size)));

                dump_image(opt, &MachImage::parse(sub, 0, LoadHint::File)?, None)?;
            }

            Ok(())
        }
    }
}

fn is_kernelcache(payload: &[u8]) -> bool {
    MachImage::parse(payload, 0, LoadHint::File)
        .map(|image| image.find_segment(SEG_PRELINK_TEXT).is_some() || image.find_segment(SEG_PRELINK_INFO).is_some())
        .unwrap_or(false)
}

fn dump_image<S: ByteSource>(opt: &Opt, image: &MachImage<S>, strings: Option<&StringTableCache>) -> Result<()> {
    let local = StringTableCache::new();
    let strings = strings.unwrap_or(&local);

    if opt.header {
        print!("{}", image.header());
    }

    if opt.load_commands {
        for (i, cmd) in image.mach_commands().iter().enumerate() {
            println!("Load command {}", i);
            print!("{}", cmd);
        }

        if let Some(err) = image.command_error() {
            warn!("load commands are incomplete, {}", err);
        }
    }

    if opt.dylibs {
        for (i, dylib) in image.dylibs(None).iter().enumerate() {
            println!("{:4} {}", i + 1, dylib);
        }
    }

    if opt.rebase {
        println!("rebase information:");

        for record in image.rebase_records() {
            println!("{}", record);
        }
    }

    if opt.bind {
        println!("bind information:");

        for kind in &[BindKind::Normal, BindKind::Weak, BindKind::Lazy] {
            for record in image.bind_records(*kind) {
                println!("{}", record);
            }
        }
    }

    if opt.exports {
        println!("export information:");

        for export in image.exports() {
            println!("{}", export);
        }
    }

    if opt.imports {
        let info = image.import_info(strings)?;

        for import in &info.imports {
            println!(
                "0x{:016x} {} ({})",
                import.address,
                import.name,
                import.dylib.as_deref().unwrap_or("?")
            );
        }
    }

    if opt.symbols {
        let sections: Vec<Section> = image
            .segments()
            .iter()
            .flat_map(|seg| seg.sections.iter().cloned())
            .collect();

        if let Some(symtab) = image.symbol_table(strings, None)? {
            for symbol in symtab.symbols() {
                match symbol.kind {
                    SymbolKind::Undefined | SymbolKind::Prebound | SymbolKind::Indirect => {
                        println!("{:16} {} {}", "", symbol.type_char(&sections), symbol.name)
                    }
                    SymbolKind::Debug(_) => {}
                    _ => println!("{:016x} {} {}", symbol.value, symbol.type_char(&sections), symbol.name),
                }
            }
        }
    }

    if opt.function_starts {
        for addr in image.function_starts() {
            println!("0x{:016x}", addr);
        }
    }

    Ok(())
}

fn dump_cache(opt: &Opt, payload: &[u8]) -> Result<()> {
    let mut flags = ParseFlags::default();

    if opt.symbols {
        flags |= ParseFlags::SYMBOLS;
    }

    let cache = SharedCache::parse(payload, flags)?;

    println!(
        "{} cache {}, {} images",
        cache.arch(),
        cache.uuid().hyphenated().to_string().to_uppercase(),
        cache.images().len()
    );

    if opt.mappings {
        for mapping in cache.mappings() {
            println!("{}", mapping);
        }
    }

    if opt.images {
        for image in cache.images() {
            println!("{}", image);
        }
    }

    if opt.pointers {
        if let Some(slide) = cache.slide_info() {
            println!("slide info v{}", slide.version());
        }

        let _ = cache.visit_slid_pointers(|addr, raw, value| {
            println!("0x{:016x} 0x{:016x} -> 0x{:016x}", addr, raw, value);

            ControlFlow::Continue(())
        });
    }

    let index = match opt.image {
        Some(ref name) => Some(
            name.parse::<usize>()
                .ok()
                .or_else(|| cache.image_index(name))
                .ok_or_else(|| anyhow!("no image {} in the cache", name))?,
        ),
        None => None,
    };

    if let Some(index) = index {
        let image = cache.open_image(index)?;

        dump_image(opt, &image, Some(cache.string_tables()))?;

        if opt.symbols {
            for symbol in cache.local_symbols(index) {
                println!("{:016x} {}", symbol.value, symbol.name);
            }
        }

        if opt.dylibs {
            for dep in cache.dependencies(index) {
                println!("  => {}", cache.image_path(dep).unwrap_or("?"));
            }
        }
    }

    if let Some(ref dump) = opt.aslr {
        let file = File::open(dump)?;
        let memory = unsafe { Mmap::map(&file) }?;
        let slide = calc_aslr_slide(&cache, memory.as_ref(), index.unwrap_or(0))?;

        println!("slide 0x{:x}", slide);
    }

    Ok(())
}

fn dump_kernelcache(opt: &Opt, payload: &[u8]) -> Result<()> {
    let kcache = KernelCache::parse(payload)?;

    dump_image(opt, kcache.image(), Some(kcache.string_tables()))?;

    if opt.kexts {
        if let Some(strategy) = kcache.strategy() {
            println!("{} kexts found with {}", kcache.kexts().len(), strategy);
        }

        for (i, kext) in kcache.kexts().iter().enumerate() {
            println!("{}", kext);

            if opt.dylibs {
                for dep in kcache.dependencies(i) {
                    println!("  => {}", kcache.kexts()[dep].name);
                }
            }
        }
    }

    if opt.pointers {
        let _ = kcache.visit_threaded_pointers(|addr, raw, value| {
            println!("0x{:016x} 0x{:016x} -> 0x{:016x}", addr, raw, value);

            ControlFlow::Continue(())
        });
    }

    Ok(())
}
