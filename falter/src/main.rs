use std::path::PathBuf;
use std::process;

use clap::Parser as ClapParser;
use log::debug;

use falter::alloc::{
    alloc_array, alloc_byte_array, alloc_class, alloc_float, alloc_function,
};
use falter::{
    FoldOptions, Intrinsic, Program, ProgramFolder, image, relocated_size,
};
use object::Value;

const DEMO_SPACE_SIZE: usize = 256 * 1024;
const DEFAULT_BASE_ADDRESS: u64 = 0x4000_0000;

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Write a relocated image of the demo program to this path
    #[arg(long, help = "Save a relocated image to the given file")]
    save: Option<PathBuf>,

    /// Load a previously saved image instead of building the demo program
    #[arg(long, help = "Load an image file and print its layout")]
    load: Option<PathBuf>,

    /// Keep the program unfolded (live-editing friendly)
    #[arg(long, help = "Skip the default fold before saving")]
    unfold_program: bool,

    /// Base address the image is positioned at (hex accepted)
    #[arg(long, help = "Relocation base address, e.g. 0x40000000")]
    base_address: Option<String>,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let base_address = match cli.base_address.as_deref().map(parse_address) {
        Some(Ok(addr)) => addr,
        Some(Err(err)) => {
            eprintln!("Error: invalid base address: {err}");
            process::exit(1);
        }
        None => DEFAULT_BASE_ADDRESS,
    };

    let program = match &cli.load {
        Some(path) => match image::load_image(path) {
            Ok(program) => {
                println!("loaded {}", path.display());
                program
            }
            Err(err) => {
                eprintln!("Error loading {}: {err}", path.display());
                process::exit(1);
            }
        },
        None => {
            let mut program = build_demo_program();
            ProgramFolder::fold_program_by_default(
                &mut program,
                &FoldOptions {
                    unfold_program: cli.unfold_program,
                },
            );
            program
        }
    };

    print_stats(&program);

    if let Some(path) = &cli.save {
        if let Err(err) = image::save_image(&program, base_address, path) {
            eprintln!("Error saving {}: {err}", path.display());
            process::exit(1);
        }
        println!("saved {}", path.display());
    }
}

fn parse_address(text: &str) -> Result<u64, std::num::ParseIntError> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    }
}

fn print_stats(program: &Program) {
    println!("mode:        {:?}", program.mode());
    println!("space used:  {} bytes", program.space().used());
    match relocated_size(program) {
        Ok(size) => println!("image size:  {size} bytes"),
        Err(err) => {
            eprintln!("Error sizing image: {err}");
            process::exit(1);
        }
    }

    let mut counts = [0usize; object::ObjectType::COUNT];
    // SAFETY: the space holds only objects built by the alloc helpers
    unsafe {
        program.space().walk(falter::OBJECT_SIZE_FN, |obj| {
            let header = &*(obj as *const object::Header);
            counts[header.object_type() as usize] += 1;
        });
    }
    println!("objects:     {}", counts.iter().sum::<usize>());
    for (index, count) in counts.iter().enumerate() {
        if *count > 0 {
            // index < COUNT by construction
            let ty = object::ObjectType::from_raw(index as u8)
                .expect("object type");
            println!("  {ty:?}: {count}");
        }
    }
    if program.is_folded() {
        // SAFETY: the constant table root is a live array while folded
        let constants: &object::Array =
            unsafe { program.constant_table.as_ref() };
        println!("constants:   {} (table)", constants.len());
    }
}

/// A small program exercising every object kind: two classes, a shared
/// string constant, a float constant, and an intrinsic-backed function.
fn build_demo_program() -> Program {
    let mut program = Program::new(DEMO_SPACE_SIZE);
    debug!("building demo program");

    let (classes, functions, entry) = {
        let space = program.space();
        // SAFETY: every reference below was just allocated in `space`
        unsafe {
            let object_name = alloc_byte_array(space, b"Object").value();
            let object_class =
                alloc_class(space, object_name, Value::from_i64(0), 0).value();
            let point_name = alloc_byte_array(space, b"Point").value();
            let point_class =
                alloc_class(space, point_name, object_class, 2).value();

            let greeting = alloc_byte_array(space, b"hello, image").value();
            let scale = alloc_float(space, 2.5).value();

            let add_name = alloc_byte_array(space, b"fixnum_add").value();
            let add = alloc_function(
                space,
                add_name,
                &[],
                &[],
                2,
                Intrinsic::FixnumAdd as i16,
            )
            .value();

            let helper_name = alloc_byte_array(space, b"scale_point").value();
            let helper = alloc_function(
                space,
                helper_name,
                &[point_class, scale, add],
                &[0x01, 0x02, 0x03],
                1,
                -1,
            )
            .value();

            let main_name = alloc_byte_array(space, b"main").value();
            let main_fn = alloc_function(
                space,
                main_name,
                &[greeting, helper, point_class],
                &[0x10, 0x11],
                0,
                -1,
            )
            .value();

            (
                vec![object_class, point_class],
                vec![main_fn, helper, add],
                main_fn,
            )
        }
    };

    // SAFETY: roots reference objects allocated above
    unsafe {
        program.classes = alloc_array(program.space(), &classes).value();
        program.functions = alloc_array(program.space(), &functions).value();
    }
    program.entry = entry;
    program
}
